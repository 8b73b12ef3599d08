pub mod errors;
pub mod formats;
pub mod model;
mod registry;

pub use errors::{ParseError, RowError};
pub use model::{Capability, DecodedFile, ObservationStream, RasterDescriptor, RawObservation};
pub use registry::{ParserRegistry, SourceDecoder};

#[cfg(test)]
mod tests;
