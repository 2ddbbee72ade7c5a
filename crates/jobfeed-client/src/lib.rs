pub mod adzuna;

pub use adzuna::{AdzunaConfig, AdzunaSource};
