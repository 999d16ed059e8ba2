//! `charon setup-uri`: explain how to provide credentials for a URI

use crate::error::CharonResult;
use crate::{config, helpers};

pub fn execute(uri: &str) -> CharonResult<()> {
    let config = config::read()?;
    let (helper, ctx) = helpers::for_uri(config.as_ref(), uri)?;
    match helper.setup_instructions(&ctx, uri) {
        Some(instructions) => println!("{instructions}"),
        None => println!(
            "{uri} needs no credential setup (handled by the {} helper)",
            helper.name()
        ),
    }
    Ok(())
}
