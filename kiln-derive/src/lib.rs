#![recursion_limit = "128"]
//! # Kiln Derive Macros
//!
//! This crate provides the `Model` derive macro for the kiln crate.
//!
//! `#[derive(Model)]` generates the static model descriptor of a struct: its
//! name, its collection and the stored name of every field. Stored names
//! follow the struct's serde attributes (`rename`, `rename_all`, `skip`), so
//! the descriptor always matches the serialized form.
//!
//! - **Supported for**: Structs with named fields and without generics
//! - **Container attribute**: `#[model(collection = "...", name = "...")]`
//! - **Field attribute**: `#[model(base)]` marks the embedded `Base` field
//!   when its type is not named `Base`
//!
//! # Examples
//!
//! ```rust,ignore
//! use kiln::model::{Base, Validate};
//! use kiln::Model;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Model, Serialize, Deserialize, Default)]
//! #[model(collection = "posts")]
//! pub struct Post {
//!     #[serde(flatten)]
//!     pub base: Base,
//!     #[serde(rename = "t")]
//!     pub title: String,
//! }
//!
//! impl Validate for Post {}
//! ```

extern crate proc_macro;
mod model;

use crate::model::generate_model_for_struct;
use proc_macro::TokenStream;
use syn::{Data, DeriveInput};

/// Derives the `Model` trait for a struct.
///
/// # Attributes
///
/// - `#[model(collection = "posts")]` - The collection the model is stored in (required)
/// - `#[model(name = "Post")]` - The model name (defaults to the struct name)
/// - `#[model(base)]` - Marks the field holding the embedded `Base`
///
/// # Errors
///
/// Returns a compile error if:
/// - Applied to an enum or union
/// - The struct has no `Base` field or is generic
/// - The collection attribute is missing
#[proc_macro_derive(Model, attributes(model))]
pub fn derive_model(input: TokenStream) -> TokenStream {
    let ast = syn::parse_macro_input!(input as DeriveInput);

    match ast.data {
        Data::Struct(ref data) => match generate_model_for_struct(&ast, data) {
            Ok(token_stream) => token_stream,
            Err(e) => {
                let error = syn::Error::new_spanned(
                    &ast,
                    format!(
                        "Failed to derive Model for struct '{}': {}.\n\
                         Example: #[derive(Model)] #[model(collection = \"posts\")] \
                         pub struct Post {{ #[serde(flatten)] base: Base }}",
                        ast.ident, e
                    ),
                );
                error.to_compile_error().into()
            }
        },
        Data::Enum(_) | Data::Union(_) => {
            let error = syn::Error::new_spanned(
                &ast,
                "Cannot derive Model for enums or unions. Only structs with named fields are supported.",
            );
            error.to_compile_error().into()
        }
    }
}
