use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// Runs an `async fn main` on a [`Runtime`] configured from the environment, with logging
/// initialised.
///
/// The function may return anything `main` can, such as `xfer_run::Result<()>`.
///
/// [`Runtime`]: https://docs.rs/xfer_run/latest/xfer_run/struct.Runtime.html
#[proc_macro_attribute]
pub fn main(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    expand_main(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_main(input: &ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    let sig = &input.sig;

    // Ensure the function is async
    if sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            sig.fn_token,
            "The #[xfer_run::main] function must be async",
        ));
    }

    if sig.ident != "main" {
        return Err(syn::Error::new_spanned(
            &sig.ident,
            "#[xfer_run::main] can only be applied to the 'main' function",
        ));
    }

    if !sig.inputs.is_empty() {
        return Err(syn::Error::new_spanned(
            &sig.inputs,
            "The #[xfer_run::main] function cannot take arguments",
        ));
    }

    let output = &sig.output;
    let body = &input.block;
    let attrs = &input.attrs;
    let vis = &input.vis;

    Ok(quote! {
        #(#attrs)*
        #vis fn main() #output {
            ::xfer_run::logging::init();

            let config = ::xfer_run::RuntimeConfig::from_env()
                .expect("Invalid runtime configuration");
            let runtime = ::xfer_run::Runtime::with_config(config)
                .expect("Failed to initialize runtime");

            // The program only returns once the async body is done.
            runtime.block_on(async #body)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    fn error_of(input: ItemFn) -> String {
        expand_main(&input).unwrap_err().to_string()
    }

    #[test]
    fn wraps_body_in_block_on() {
        let input: ItemFn = parse_quote! {
            async fn main() -> xfer_run::Result<()> { Ok(()) }
        };
        let expanded = expand_main(&input).unwrap().to_string();

        assert!(expanded.starts_with("fn main ()"));
        assert!(expanded.contains("Result"));
        assert!(expanded.contains("logging :: init ()"));
        assert!(expanded.contains("block_on (async {"));
    }

    #[test]
    fn rejects_wrong_signatures() {
        assert!(error_of(parse_quote! { fn main() {} }).contains("must be async"));
        assert!(error_of(parse_quote! { async fn start() {} }).contains("'main' function"));
        assert!(error_of(parse_quote! { async fn main(n: u8) {} }).contains("cannot take"));
    }
}
