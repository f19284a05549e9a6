use serde::Serialize;
use std::fmt;

/// The three model tiers the claude CLI accepts for `--model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelAlias {
    Opus,
    Sonnet,
    Haiku,
}

impl ModelAlias {
    pub const ALL: [ModelAlias; 3] = [ModelAlias::Opus, ModelAlias::Sonnet, ModelAlias::Haiku];

    /// Value passed to the CLI's `--model` flag.
    pub fn as_str(self) -> &'static str {
        match self {
            ModelAlias::Opus => "opus",
            ModelAlias::Sonnet => "sonnet",
            ModelAlias::Haiku => "haiku",
        }
    }

    /// Public model id advertised on `/v1/models`.
    pub fn canonical_id(self) -> &'static str {
        match self {
            ModelAlias::Opus => "claude-opus-4",
            ModelAlias::Sonnet => "claude-sonnet-4",
            ModelAlias::Haiku => "claude-haiku-4",
        }
    }
}

impl fmt::Display for ModelAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DEFAULT_ALIAS: ModelAlias = ModelAlias::Opus;

// Lookup is exact and case-sensitive.
static MODEL_ALIASES: &[(&str, ModelAlias)] = &[
    ("opus", ModelAlias::Opus),
    ("claude-opus-4", ModelAlias::Opus),
    ("claude-opus-4-0", ModelAlias::Opus),
    ("claude-opus-4-1", ModelAlias::Opus),
    ("claude-opus-4-5", ModelAlias::Opus),
    ("claude-4-opus", ModelAlias::Opus),
    ("claude-3-opus", ModelAlias::Opus),
    ("claude-3-opus-latest", ModelAlias::Opus),
    ("sonnet", ModelAlias::Sonnet),
    ("claude-sonnet-4", ModelAlias::Sonnet),
    ("claude-sonnet-4-0", ModelAlias::Sonnet),
    ("claude-sonnet-4-5", ModelAlias::Sonnet),
    ("claude-4-sonnet", ModelAlias::Sonnet),
    ("claude-3-7-sonnet", ModelAlias::Sonnet),
    ("claude-3-7-sonnet-latest", ModelAlias::Sonnet),
    ("claude-3-5-sonnet", ModelAlias::Sonnet),
    ("claude-3-5-sonnet-latest", ModelAlias::Sonnet),
    ("haiku", ModelAlias::Haiku),
    ("claude-haiku-4", ModelAlias::Haiku),
    ("claude-haiku-4-5", ModelAlias::Haiku),
    ("claude-3-5-haiku", ModelAlias::Haiku),
    ("claude-3-5-haiku-latest", ModelAlias::Haiku),
    ("claude-3-haiku", ModelAlias::Haiku),
];

fn lookup(id: &str) -> Option<ModelAlias> {
    MODEL_ALIASES
        .iter()
        .find(|(name, _)| *name == id)
        .map(|(_, alias)| *alias)
}

/// Like [`resolve_model`] but without the default: `None` when neither the
/// identifier nor its provider-stripped suffix is a known name.
pub fn lookup_model(model: &str) -> Option<ModelAlias> {
    lookup(model).or_else(|| {
        model
            .split_once('/')
            .and_then(|(_, suffix)| lookup(suffix))
    })
}

/// Map any client-supplied model identifier onto a CLI alias.
///
/// Accepts canonical names, short aliases and provider-prefixed forms such as
/// `openrouter/claude-sonnet-4`. Anything else, including a missing model,
/// falls back to opus.
pub fn resolve_model(model: Option<&str>) -> ModelAlias {
    model.and_then(lookup_model).unwrap_or(DEFAULT_ALIAS)
}
