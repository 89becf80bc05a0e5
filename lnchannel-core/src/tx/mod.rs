/// Script templates, witness builders and script parsing
pub mod script;
/// Funding, commitment, closing and sweep transactions
#[allow(clippy::module_inception)]
pub mod tx;
