//! Credential generator for initial instance admin accounts.

pub mod generator;

pub use generator::{generate, generate_default, validate, CredentialRule, DEFAULT_LENGTH, MIN_LENGTH};
