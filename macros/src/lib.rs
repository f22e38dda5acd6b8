//! Proc macros for the cntryl-testcase runtime.
//!
//! This crate provides the `#[testcase]` attribute for registering test
//! functions and `testcase_main!` for generating the harness entry point.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Expr, ItemFn, Lit, Meta, Token};

/// Register a function as a test case.
///
/// The function must take exactly one argument, `&mut TestCase`.
///
/// # Example
///
/// ```rust,ignore
/// use cntryl_testcase::{tc_assert, testcase, TestCase};
///
/// #[testcase]
/// fn empty_vector_has_no_items(tc: &mut TestCase) {
///     let v: Vec<u8> = Vec::new();
///     tc_assert!(tc, v.is_empty());
/// }
/// ```
///
/// # Attributes
///
/// - `#[testcase]`: basic test
/// - `#[testcase(ignore)]`: skipped unless `--include-ignored` is passed
/// - `#[testcase(name = "custom_name")]`: registered under a custom name
#[proc_macro_attribute]
pub fn testcase(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    expand_testcase(attr.into(), input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_testcase(attr: TokenStream2, input: ItemFn) -> syn::Result<TokenStream2> {
    let options = parse_options(attr)?;

    if input.sig.inputs.len() != 1 {
        return Err(syn::Error::new_spanned(
            &input.sig,
            "#[testcase] functions take exactly one `&mut TestCase` argument",
        ));
    }
    if let Some(asyncness) = &input.sig.asyncness {
        return Err(syn::Error::new_spanned(asyncness, "#[testcase] functions cannot be async"));
    }

    let fn_name = &input.sig.ident;
    let name = options.name.unwrap_or_else(|| fn_name.to_string());
    let ignored = options.ignore;
    let entry_ident = format_ident!("__TESTCASE_ENTRY_{}", fn_name.to_string().to_uppercase());

    Ok(quote! {
        #input

        #[allow(non_upper_case_globals)]
        #[::cntryl_testcase::__private::linkme::distributed_slice(
            ::cntryl_testcase::__private::TEST_CASES
        )]
        #[linkme(crate = ::cntryl_testcase::__private::linkme)]
        static #entry_ident: ::cntryl_testcase::__private::TestEntry =
            ::cntryl_testcase::__private::TestEntry {
                name: #name,
                func: #fn_name,
                ignored: #ignored,
                module_path: module_path!(),
            };
    })
}

#[derive(Default)]
struct Options {
    ignore: bool,
    name: Option<String>,
}

fn parse_options(attr: TokenStream2) -> syn::Result<Options> {
    let mut options = Options::default();
    let metas = Punctuated::<Meta, Token![,]>::parse_terminated.parse2(attr)?;
    for meta in metas {
        match &meta {
            Meta::Path(path) if path.is_ident("ignore") => options.ignore = true,
            Meta::NameValue(nv) if nv.path.is_ident("name") => match &nv.value {
                Expr::Lit(expr) => match &expr.lit {
                    Lit::Str(s) => options.name = Some(s.value()),
                    other => {
                        return Err(syn::Error::new_spanned(other, "expected a string literal"))
                    }
                },
                other => {
                    return Err(syn::Error::new_spanned(other, "expected a string literal"))
                }
            },
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "unknown option; expected `ignore` or `name = \"...\"`",
                ))
            }
        }
    }
    Ok(options)
}

/// Generate the `main` function of a test binary.
///
/// Place this at the end of a `harness = false` test target to run every
/// `#[testcase]` function linked into the binary.
///
/// # Example
///
/// ```rust,ignore
/// use cntryl_testcase::{testcase, testcase_main, TestCase};
///
/// #[testcase]
/// fn always_passes(_tc: &mut TestCase) {}
///
/// testcase_main!();
/// ```
#[proc_macro]
pub fn testcase_main(_input: TokenStream) -> TokenStream {
    let expanded = quote! {
        fn main() -> ::std::process::ExitCode {
            ::cntryl_testcase::harness_main()
        }
    };
    TokenStream::from(expanded)
}
