//! Image taggers.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::images::split_tag;
use crate::domain::Artifact;

use super::{TagContext, Tagger};

/// How image references are tagged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagPolicy {
    /// Tag with the abbreviated input hash (`app:3f2a9c81d0e4`)
    #[default]
    InputDigest,

    /// Tag with the run id and dev iteration (`app:1a2b3c4d-3`)
    Session,

    /// Always use the same tag
    Literal(String),
}

/// Build a tagger for a policy
pub fn tagger_for(policy: &TagPolicy) -> Arc<dyn Tagger> {
    match policy {
        TagPolicy::InputDigest => Arc::new(InputDigestTagger),
        TagPolicy::Session => Arc::new(SessionTagger),
        TagPolicy::Literal(tag) => Arc::new(LiteralTagger::new(tag.clone())),
    }
}

fn repository(image: &str) -> &str {
    split_tag(image).0
}

/// Content-addressed tags: unchanged inputs keep their tag
pub struct InputDigestTagger;

impl Tagger for InputDigestTagger {
    fn tag(&self, _artifact: &Artifact, ctx: &TagContext<'_>) -> Result<String> {
        Ok(format!("{}:{}", repository(ctx.image), ctx.input_hash.short()))
    }
}

/// Per-session tags: every iteration produces a fresh tag
pub struct SessionTagger;

impl Tagger for SessionTagger {
    fn tag(&self, _artifact: &Artifact, ctx: &TagContext<'_>) -> Result<String> {
        let run = &ctx.run_id[..ctx.run_id.len().min(8)];
        Ok(format!("{}:{}-{}", repository(ctx.image), run, ctx.iteration))
    }
}

/// Fixed tag (e.g. `latest`)
pub struct LiteralTagger {
    tag: String,
}

impl LiteralTagger {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl Tagger for LiteralTagger {
    fn tag(&self, _artifact: &Artifact, ctx: &TagContext<'_>) -> Result<String> {
        if self.tag.is_empty() || self.tag.contains(['/', ':', '@']) {
            anyhow::bail!("Invalid literal tag '{}'", self.tag);
        }
        Ok(format!("{}:{}", repository(ctx.image), self.tag))
    }
}
