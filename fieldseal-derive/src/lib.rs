//! Derive macros for `fieldseal`.
//!
//! `#[derive(Model)]` maps a struct with named fields to a
//! `fieldseal::record::Record` and back.

#![warn(clippy::pedantic, clippy::nursery)]

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DeriveInput, Error, Fields, LitStr};

/// Derives `fieldseal::record::Model`.
///
/// The struct needs `#[model(table = "...")]` and exactly one `i64` field
/// marked `#[model(id)]`. Every other field becomes a column named after the
/// field, unless renamed with `#[model(column = "...")]`, and must implement
/// `fieldseal::value::FieldValue`.
///
/// # Example
///
/// ```rust,ignore
/// use fieldseal_derive::Model;
///
/// #[derive(Model)]
/// #[model(table = "users")]
/// struct User {
///     #[model(id)]
///     id: i64,
///     email: String,
///     #[model(column = "name")]
///     display_name: Option<String>,
/// }
/// ```
#[proc_macro_derive(Model, attributes(model))]
pub fn derive_model(input: TokenStream) -> TokenStream {
    let input: DeriveInput = match syn::parse(input) {
        Ok(input) => input,
        Err(err) => return err.to_compile_error().into(),
    };
    expand(&input).unwrap_or_else(Error::into_compile_error).into()
}

/// Per-field settings from `#[model(...)]`.
#[derive(Default)]
struct FieldAttrs {
    id: bool,
    column: Option<String>,
}

const NAMED_FIELDS_ONLY: &str = "Model can only be derived for structs with named fields";

fn expand(input: &DeriveInput) -> Result<TokenStream2, Error> {
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let table = table_name(input)?;
    let Data::Struct(data) = &input.data else {
        return Err(Error::new_spanned(ident, NAMED_FIELDS_ONLY));
    };
    let Fields::Named(named) = &data.fields else {
        return Err(Error::new_spanned(&data.fields, NAMED_FIELDS_ONLY));
    };

    let mut id_field = None;
    let mut to_columns = Vec::new();
    let mut from_columns = Vec::new();

    for field in &named.named {
        let field_ident = field
            .ident
            .as_ref()
            .ok_or_else(|| Error::new_spanned(field, "expected a named field"))?;
        let attrs = field_attrs(field)?;

        if attrs.id {
            if id_field.is_some() {
                return Err(Error::new_spanned(field, "only one field can be #[model(id)]"));
            }
            id_field = Some(field_ident);
            continue;
        }

        let column = attrs.column.unwrap_or_else(|| field_ident.to_string());
        to_columns.push(quote! {
            if let ::core::option::Option::Some(value) =
                ::fieldseal::value::FieldValue::into_plain(self.#field_ident)
            {
                record.set_plain(#column, value);
            }
        });
        from_columns.push(quote! {
            #field_ident: ::fieldseal::value::FieldValue::from_plain(
                #column,
                record.take_plain(#column)?,
            )?,
        });
    }

    let id = id_field
        .ok_or_else(|| Error::new_spanned(ident, "Model needs a field marked #[model(id)]"))?;

    Ok(quote! {
        impl #impl_generics ::fieldseal::record::Model for #ident #ty_generics #where_clause {
            const TABLE: &'static str = #table;

            fn into_record(self) -> ::fieldseal::record::Record {
                let mut record = ::fieldseal::record::Record::new(self.#id);
                #(#to_columns)*
                record
            }

            fn from_record(
                mut record: ::fieldseal::record::Record,
            ) -> ::core::result::Result<Self, ::fieldseal::error::Error> {
                ::core::result::Result::Ok(Self {
                    #id: record.id(),
                    #(#from_columns)*
                })
            }
        }
    })
}

fn table_name(input: &DeriveInput) -> Result<String, Error> {
    let mut table = None;
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("model")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                let value: LitStr = meta.value()?.parse()?;
                table = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported model attribute, expected `table`"))
            }
        })?;
    }
    table.ok_or_else(|| Error::new_spanned(&input.ident, "missing #[model(table = \"...\")]"))
}

fn field_attrs(field: &syn::Field) -> Result<FieldAttrs, Error> {
    let mut attrs = FieldAttrs::default();
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("model")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("id") {
                attrs.id = true;
                Ok(())
            } else if meta.path.is_ident("column") {
                let value: LitStr = meta.value()?.parse()?;
                attrs.column = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported field attribute, expected `id` or `column`"))
            }
        })?;
    }
    Ok(attrs)
}
