mod decoder;

pub use decoder::{EventDecoder, SUPPORTED_SCHEMA_VERSION};
