extern crate proc_macro;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Ident, Index, parse_macro_input};

/// Derives `crate::storage::encdec::Encode` by encoding each field in declaration order.
#[proc_macro_derive(Encode)]
pub fn encode_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let fields = match struct_fields(&name, input.data, "Encode") {
        Ok(fields) => fields,
        Err(err) => return err.to_compile_error().into(),
    };

    let appends: Vec<TokenStream2> = match &fields {
        Fields::Named(named) => named
            .named
            .iter()
            .map(|f| {
                let field_name = &f.ident;
                quote! { encoder = encoder.append(&self.#field_name); }
            })
            .collect(),
        Fields::Unnamed(unnamed) => (0..unnamed.unnamed.len())
            .map(|i| {
                let idx = Index::from(i);
                quote! { encoder = encoder.append(&self.#idx); }
            })
            .collect(),
        Fields::Unit => Vec::new(),
    };

    quote! {
        impl crate::storage::encdec::Encode for #name {
            fn encode(&self) -> Vec<u8> {
                let mut encoder = crate::storage::encdec::EncodeBuilder::new();

                #(#appends)*

                encoder.build()
            }
        }
    }
    .into()
}

/// Derives `crate::storage::encdec::Decode`, consuming fields in declaration order and returning
/// the unread remainder.
#[proc_macro_derive(Decode)]
pub fn decode_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let fields = match struct_fields(&name, input.data, "Decode") {
        Ok(fields) => fields,
        Err(err) => return err.to_compile_error().into(),
    };

    let (bindings, construct) = match &fields {
        Fields::Named(named) => {
            let names: Vec<Ident> = named
                .named
                .iter()
                .filter_map(|f| f.ident.clone())
                .collect();
            let types = named.named.iter().map(|f| &f.ty);

            (
                field_decodes(&names, types),
                quote! { Self { #(#names),* } },
            )
        }
        Fields::Unnamed(unnamed) => {
            let names: Vec<Ident> = (0..unnamed.unnamed.len())
                .map(|i| format_ident!("field{}", i))
                .collect();
            let types = unnamed.unnamed.iter().map(|f| &f.ty);

            (field_decodes(&names, types), quote! { Self(#(#names),*) })
        }
        Fields::Unit => (Vec::new(), quote! { Self }),
    };

    quote! {
        impl crate::storage::encdec::Decode for #name {
            fn decode(bytes: &[u8]) -> crate::DecodingResult<Self> {
                let mut bytes = bytes;

                #(#bindings)*

                Ok((#construct, bytes))
            }
        }
    }
    .into()
}

fn struct_fields(name: &Ident, data: Data, derive: &str) -> Result<Fields, syn::Error> {
    match data {
        Data::Struct(data) => Ok(data.fields),
        _ => Err(syn::Error::new_spanned(
            name,
            format!("{derive} only supports structs"),
        )),
    }
}

fn field_decodes<'a>(
    names: &'a [Ident],
    types: impl Iterator<Item = &'a syn::Type> + 'a,
) -> Vec<TokenStream2> {
    names
        .iter()
        .zip(types)
        .map(|(field_name, field_ty)| {
            quote! {
                let (#field_name, rest) = <#field_ty as crate::storage::encdec::Decode>::decode(bytes)?;
                bytes = rest;
            }
        })
        .collect()
}
