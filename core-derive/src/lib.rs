//! Derive macros for `wardline-core` gate stages.
//!
//! This crate provides the `#[derive(GateStage)]` macro for automatically
//! implementing the `GateStage` trait on the unit/marker structs that
//! identify each stage in the gate executor's fixed pipeline order.
//!
//! # Example
//!
//! ```ignore
//! use wardline_core::pipeline::GateStage;
//!
//! #[derive(GateStage)]
//! #[gate(id = "shield")]
//! struct ShieldGate;
//! ```
//!
//! The macro generates a `GateStage` implementation returning the declared
//! `id` and the struct's name (in `snake_case`) as the human-readable label.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, DeriveInput, Error, LitStr};

#[proc_macro_derive(GateStage, attributes(gate))]
pub fn derive_gate_stage(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match derive_gate_stage_impl(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn derive_gate_stage_impl(input: DeriveInput) -> Result<TokenStream2, Error> {
    let name = &input.ident;

    let id = parse_gate_id(&input)?.unwrap_or_else(|| to_snake_case(&name.to_string()));
    let label = to_snake_case(&name.to_string());

    Ok(quote! {
        impl crate::pipeline::GateStage for #name {
            fn stage_id(&self) -> &'static str {
                #id
            }

            fn stage_name(&self) -> &'static str {
                #label
            }
        }
    })
}

fn parse_gate_id(input: &DeriveInput) -> Result<Option<String>, Error> {
    for attr in &input.attrs {
        if !attr.path().is_ident("gate") {
            continue;
        }
        let mut found = None;
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("id") {
                let value = meta.value()?;
                let lit: LitStr = value.parse()?;
                found = Some(lit.value());
                Ok(())
            } else {
                Err(meta.error("unsupported gate attribute, expected `id`"))
            }
        })?;
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i != 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
