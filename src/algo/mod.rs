pub mod ewma;
pub mod isolation_forest;
pub mod stats;

// Re-exports for convenience
pub use ewma::EWMA;
pub use isolation_forest::IsolationForest;
