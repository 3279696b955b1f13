pub mod channel;
pub mod grader;
pub mod result;
pub mod testcase;

pub use channel::*;
pub use grader::*;
pub use result::*;
pub use testcase::*;
