pub mod ann;
pub mod keyword;

pub use ann::LinearAnnIndex;
pub use keyword::KeywordIndex;
