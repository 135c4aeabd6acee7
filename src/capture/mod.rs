pub mod codec;
pub mod finder;
pub mod parser;
pub mod pipeline;
pub mod tools;
pub mod transform;
