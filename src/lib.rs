pub mod burn_ext {
    pub mod backend;
    pub mod ctc;
}
pub mod converter;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod labels;
pub mod parse_config;
pub mod runner;
pub mod utils {
    pub mod tensor_ext;
}

pub use burn_ext::{
    backend::{Backend, WarpCtc, WarpCtcOptions},
    ctc::{CtcGreedyDecoder, CtcOutput, WarpCtcLoss, WarpCtcLossConfig},
};
pub use error::{CtcError, ErrorKind};
