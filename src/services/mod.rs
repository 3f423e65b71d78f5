// CheekAI Core Services

pub mod text_processor;
pub mod structure;
pub mod config_store;
pub mod providers;
pub mod document_reader;
pub mod detection;

pub use text_processor::*;
pub use structure::*;
pub use config_store::*;
pub use providers::*;
pub use document_reader::{decode_document, guess_language, read_document, DocumentError};
