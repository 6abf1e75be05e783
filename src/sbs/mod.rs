//! SBS-1 (BaseStation) protocol support.

pub mod parser;

pub use parser::{SbsMessage, TransmissionType, parse_sbs_line};
