//! Conversion endpoints.
//!
//! Inputs and outputs share the flag-backed argument framework in
//! [`arguments`] and answer probe queries by walking explicit references:
//! an output asks its conversion's first input, a chained input asks the
//! output it reads from.

pub mod arguments;
pub mod input;
pub mod output;

use std::sync::Arc;

use parking_lot::Mutex;

pub use arguments::{ArgumentSet, ArgumentSpec, Flag, GLOBAL_ARGUMENTS, INPUT_ARGUMENTS, OUTPUT_ARGUMENTS};
pub use input::{Input, InputSource, SourceProvider};
pub use output::{Output, OutputStream, OutputTarget};

/// Inputs of one conversion, shared with its outputs.
pub(crate) type InputList = Arc<Mutex<Vec<Input>>>;
