use proc_macro::TokenStream;
use quote::quote;
use syn::meta::ParseNestedMeta;
use syn::{Attribute, DataStruct, DeriveInput, Fields, LitStr, Result, Token, Type};

/// Serde attributes of a single field that affect its stored name.
#[derive(Default)]
struct SerdeField {
    rename: Option<String>,
    skip: bool,
    flatten: bool,
}

/// Consumes the value of a serde attribute kiln does not interpret.
fn skip_meta(meta: &ParseNestedMeta) -> Result<()> {
    if meta.input.peek(Token![=]) {
        let _: syn::Expr = meta.value()?.parse()?;
    } else if meta.input.peek(syn::token::Paren) {
        meta.parse_nested_meta(|nested| skip_meta(&nested))?;
    }
    Ok(())
}

fn parse_serde_field(attrs: &[Attribute]) -> Result<SerdeField> {
    let mut field = SerdeField::default();
    for attr in attrs {
        if !attr.path().is_ident("serde") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename") && meta.input.peek(Token![=]) {
                let s: LitStr = meta.value()?.parse()?;
                field.rename = Some(s.value());
                Ok(())
            } else if meta.path.is_ident("skip") || meta.path.is_ident("skip_serializing") {
                field.skip = true;
                Ok(())
            } else if meta.path.is_ident("flatten") {
                field.flatten = true;
                Ok(())
            } else {
                skip_meta(&meta)
            }
        })?;
    }
    Ok(field)
}

fn parse_rename_all(attrs: &[Attribute]) -> Result<Option<String>> {
    let mut rename_all = None;
    for attr in attrs {
        if !attr.path().is_ident("serde") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename_all") && meta.input.peek(Token![=]) {
                let s: LitStr = meta.value()?.parse()?;
                rename_all = Some(s.value());
                Ok(())
            } else {
                skip_meta(&meta)
            }
        })?;
    }
    Ok(rename_all)
}

/// Applies a serde `rename_all` rule to a snake case field name.
fn apply_rename_all(rule: &str, name: &str) -> Result<String> {
    let words: Vec<&str> = name.split('_').filter(|word| !word.is_empty()).collect();
    let capitalize = |word: &str| {
        let mut chars = word.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => String::new(),
        }
    };

    let renamed = match rule {
        "lowercase" => name.to_lowercase(),
        "UPPERCASE" => name.to_uppercase(),
        "snake_case" => name.to_string(),
        "SCREAMING_SNAKE_CASE" => name.to_uppercase(),
        "kebab-case" => name.replace('_', "-"),
        "SCREAMING-KEBAB-CASE" => name.replace('_', "-").to_uppercase(),
        "PascalCase" => words.iter().map(|word| capitalize(word)).collect(),
        "camelCase" => words
            .iter()
            .enumerate()
            .map(|(i, word)| if i == 0 { word.to_string() } else { capitalize(word) })
            .collect(),
        other => {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                format!("unsupported rename_all rule {}", other),
            ))
        }
    };
    Ok(renamed)
}

fn is_base_type(ty: &Type) -> bool {
    match ty {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "Base"),
        _ => false,
    }
}

fn has_model_base(attrs: &[Attribute]) -> Result<bool> {
    let mut base = false;
    for attr in attrs {
        if attr.path().is_ident("model") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("base") {
                    base = true;
                    Ok(())
                } else {
                    Err(meta.error("Unknown model field attribute"))
                }
            })?;
        }
    }
    Ok(base)
}

pub(crate) fn generate_model_for_struct(ast: &DeriveInput, data: &DataStruct) -> Result<TokenStream> {
    let name = &ast.ident;
    if !ast.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(&ast.generics, "generic models are not supported"));
    }

    let mut model_name = name.to_string();
    let mut collection: Option<String> = None;
    for attr in &ast.attrs {
        if attr.path().is_ident("model") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("collection") {
                    let s: LitStr = meta.value()?.parse()?;
                    collection = Some(s.value());
                    Ok(())
                } else if meta.path.is_ident("name") {
                    let s: LitStr = meta.value()?.parse()?;
                    model_name = s.value();
                    Ok(())
                } else {
                    Err(meta.error("Unknown model attribute"))
                }
            })?;
        }
    }

    let collection = collection.ok_or_else(|| {
        syn::Error::new_spanned(ast, "missing #[model(collection = \"...\")] attribute")
    })?;

    let named = match &data.fields {
        Fields::Named(named) => named,
        _ => return Err(syn::Error::new_spanned(ast, "only structs with named fields are supported")),
    };

    let rename_all = parse_rename_all(&ast.attrs)?;
    let mut base_field = None;
    let mut fields = Vec::with_capacity(named.named.len());
    for field in &named.named {
        let ident = match &field.ident {
            Some(ident) => ident,
            None => continue,
        };

        if has_model_base(&field.attrs)? || (base_field.is_none() && is_base_type(&field.ty)) {
            if base_field.is_some() {
                return Err(syn::Error::new_spanned(field, "multiple base fields are not allowed"));
            }
            base_field = Some(ident.clone());
            continue;
        }

        let serde = parse_serde_field(&field.attrs)?;
        if serde.skip || serde.flatten {
            continue;
        }

        let field_name = ident.to_string();
        let field_name = field_name.strip_prefix("r#").unwrap_or(&field_name).to_string();
        let stored = match (serde.rename, &rename_all) {
            (Some(rename), _) => rename,
            (None, Some(rule)) => apply_rename_all(rule, &field_name)?,
            (None, None) => field_name.clone(),
        };
        fields.push(quote! { kiln::model::Field::new(#field_name, #stored) });
    }

    let base_field = base_field.ok_or_else(|| {
        syn::Error::new_spanned(ast, "missing base field, add `#[serde(flatten)] base: Base`")
    })?;

    let gen = quote! {
        impl kiln::model::Model for #name {
            fn meta() -> &'static kiln::model::Meta {
                static META: kiln::once_cell::sync::Lazy<kiln::model::Meta> =
                    kiln::once_cell::sync::Lazy::new(|| {
                        kiln::model::Meta::new::<#name>(#model_name, #collection, vec![#(#fields),*])
                    });
                &META
            }

            fn base(&self) -> &kiln::model::Base {
                &self.#base_field
            }

            fn base_mut(&mut self) -> &mut kiln::model::Base {
                &mut self.#base_field
            }
        }
    };

    Ok(gen.into())
}
