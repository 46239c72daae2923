//! Core trait definitions for velocyte.

/// A type that can produce a summary of its contents.
pub trait Summarizable {
    /// A one-line summary suitable for display.
    fn summary(&self) -> String;
}

/// A type that carries a goodness-of-fit score in `[0, 1]`.
pub trait Scored {
    /// The score value.
    fn score(&self) -> f64;
}
