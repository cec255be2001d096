//! Presentation adapters.

pub mod rerun;

pub use self::rerun::RerunPresenter;
