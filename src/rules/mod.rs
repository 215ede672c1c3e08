//! Built-in Rule Pack
//!
//! - `header` - Header extent generator and `truncated_header`
//! - `permissions` - `world_writable_binary`
//! - `digest` - Content digests and the combined `duplicate_content` rule

pub mod digest;
pub mod header;
pub mod permissions;

use std::sync::Arc;

use binscope_core::CoreResult;
use binscope_engine::SharedContextBuilder;

pub use digest::{
    ContentDigest, ContentDigestGenerator, DigestIndex, DigestIndexGenerator, DuplicateContentRule,
};
pub use header::{HeaderInfo, HeaderInfoGenerator, TruncatedHeaderRule};
pub use permissions::WorldWritableRule;

/// Register every built-in generator and rule.
pub fn register(builder: &mut SharedContextBuilder) -> CoreResult<()> {
    builder
        .generator(Arc::new(HeaderInfoGenerator))?
        .async_generator(Arc::new(ContentDigestGenerator))?
        .combined_generator(Arc::new(DigestIndexGenerator))?
        .rule(Arc::new(TruncatedHeaderRule))?
        .rule(Arc::new(WorldWritableRule))?
        .combined_rule(Arc::new(DuplicateContentRule))?;
    Ok(())
}
