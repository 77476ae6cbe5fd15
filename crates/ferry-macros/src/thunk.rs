// #[derive(Thunk)] implementation
//
// Lays a struct out field by field in guest memory and translates nested
// pointers and handles through each field's own Thunk impl.

use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Result};

/// Expands `#[derive(Thunk)]`.
///
/// Example expansion:
/// ```ignore
/// // Input:
/// #[derive(Thunk)]
/// pub struct TextRun { pub text: HostAddr, pub len: u32 }
///
/// // Output:
/// #[derive(Debug, Clone, PartialEq)]
/// pub struct TextRunGuest { pub text: GuestAddr, pub len: u32 }
///
/// impl Thunk for TextRun {
///     type Guest = TextRunGuest;
///     const NESTED: bool = false || <HostAddr as Thunk>::NESTED || <u32 as Thunk>::NESTED;
///     fn layout(bits: Bitness) -> GuestLayout {
///         GuestLayout::record(&[<HostAddr as Thunk>::layout(bits), <u32 as Thunk>::layout(bits)])
///     }
///     ...
/// }
/// ```
pub fn expand_thunk(input: DeriveInput) -> Result<TokenStream> {
    let ident = &input.ident;
    let vis = &input.vis;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.generics,
            "Thunk cannot be derived for generic types",
        ));
    }

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Thunk can only be derived for structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                ident,
                "Thunk can only be derived for structs",
            ))
        }
    };

    let guest_ident = format_ident!("{}Guest", ident);
    let guest_doc = format!("Untranslated guest view of [`{}`].", ident);

    let names: Vec<_> = fields.iter().filter_map(|f| f.ident.as_ref()).collect();
    let types: Vec<_> = fields.iter().map(|f| &f.ty).collect();
    let visibilities: Vec<_> = fields.iter().map(|f| &f.vis).collect();

    Ok(quote! {
        #[doc = #guest_doc]
        #[derive(Debug, Clone, PartialEq)]
        #vis struct #guest_ident {
            #(#visibilities #names: <#types as ::ferry_abi::Thunk>::Guest,)*
        }

        impl ::ferry_abi::Thunk for #ident {
            type Guest = #guest_ident;

            const NESTED: bool = false #(|| <#types as ::ferry_abi::Thunk>::NESTED)*;

            fn layout(bits: ::ferry_abi::Bitness) -> ::ferry_abi::GuestLayout {
                ::ferry_abi::GuestLayout::record(&[
                    #(<#types as ::ferry_abi::Thunk>::layout(bits)),*
                ])
            }

            fn read(
                __r: &mut ::ferry_abi::GuestReader<'_>,
            ) -> ::std::result::Result<Self, ::ferry_abi::TranslateError> {
                let __align = <Self as ::ferry_abi::Thunk>::layout(__r.bits()).align;
                __r.align(__align);
                #(let #names = <#types as ::ferry_abi::Thunk>::read(__r)?;)*
                __r.align(__align);
                Ok(Self { #(#names),* })
            }

            fn write(
                &self,
                __w: &mut ::ferry_abi::GuestWriter<'_>,
            ) -> ::std::result::Result<(), ::ferry_abi::TranslateError> {
                let __align = <Self as ::ferry_abi::Thunk>::layout(__w.bits()).align;
                __w.align(__align);
                #(<#types as ::ferry_abi::Thunk>::write(&self.#names, __w)?;)*
                __w.align(__align);
                Ok(())
            }

            fn read_guest(
                __r: &mut ::ferry_abi::GuestReader<'_>,
            ) -> ::std::result::Result<#guest_ident, ::ferry_abi::TranslateError> {
                let __align = <Self as ::ferry_abi::Thunk>::layout(__r.bits()).align;
                __r.align(__align);
                #(let #names = <#types as ::ferry_abi::Thunk>::read_guest(__r)?;)*
                __r.align(__align);
                Ok(#guest_ident { #(#names),* })
            }

            fn write_guest(
                value: &#guest_ident,
                __w: &mut ::ferry_abi::GuestWriter<'_>,
            ) -> ::std::result::Result<(), ::ferry_abi::TranslateError> {
                let __align = <Self as ::ferry_abi::Thunk>::layout(__w.bits()).align;
                __w.align(__align);
                #(<#types as ::ferry_abi::Thunk>::write_guest(&value.#names, __w)?;)*
                __w.align(__align);
                Ok(())
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_tuple_struct() {
        let input: DeriveInput = syn::parse_quote! {
            struct Pair(u32, u32);
        };
        let err = expand_thunk(input).unwrap_err();
        assert!(err.to_string().contains("named fields"));
    }

    #[test]
    fn test_rejects_enum() {
        let input: DeriveInput = syn::parse_quote! {
            enum Mode { A, B }
        };
        assert!(expand_thunk(input).is_err());
    }

    #[test]
    fn test_generates_companion() {
        let input: DeriveInput = syn::parse_quote! {
            pub struct TextRun { pub text: HostAddr, pub len: u32 }
        };
        let tokens = expand_thunk(input).unwrap().to_string();
        assert!(tokens.contains("struct TextRunGuest"));
        assert!(tokens.contains("type Guest = TextRunGuest"));
    }
}
