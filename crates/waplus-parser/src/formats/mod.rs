mod common;
mod long_table;
mod raster_hdr;
mod raster_json;
mod wide_table;

pub use common::parse_timestamp;
pub use long_table::LongTableDecoder;
pub use raster_hdr::RasterHdrDecoder;
pub use raster_json::RasterJsonDecoder;
pub use wide_table::WideTableDecoder;
