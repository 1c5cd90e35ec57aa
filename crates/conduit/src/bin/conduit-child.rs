//! conduit-child — stock child program serving only the built-in functions.

use anyhow::{Context, Result};

use conduit::{child, FunctionRegistry};

fn main() -> Result<()> {
    child::run(FunctionRegistry::new()).context("conduit child failed")
}
