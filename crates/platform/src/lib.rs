//! # Tether Platform
//!
//! Core error and result types shared by the tether SSH stack.
//!
//! # Examples
//!
//! ```
//! use tether_platform::{TetherError, TetherResult};
//!
//! fn example_function() -> TetherResult<String> {
//!     Ok("Hello, tether!".to_string())
//! }
//!
//! # fn main() -> TetherResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, tether!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{TetherError, TetherResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
