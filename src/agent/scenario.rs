//! Prompt → scenario resolution for the reference agent.

/// What the reference agent does for one prompt turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scenario {
    /// Three fixed chunks, then `end_turn`.
    Simple,
    /// A tool call through its whole lifecycle, then `end_turn`.
    Tool,
    /// A tool call gated on a permission request.
    Permission,
    /// One refusal chunk, then `refusal`.
    Refuse,
    /// Chunks until the turn is cancelled.
    Stream,
    /// One confirmation chunk for a conversation reset.
    Clear,
    /// Anything else: echo the prompt back.
    Echo(String),
}

/// Trigger words and the scenario each selects.
const TRIGGERS: &[(&str, Scenario)] = &[
    ("simple", Scenario::Simple),
    ("tool", Scenario::Tool),
    ("permission", Scenario::Permission),
    ("refuse", Scenario::Refuse),
    ("stream", Scenario::Stream),
    ("/clear", Scenario::Clear),
];

impl Scenario {
    /// Resolve the scenario for a prompt's text.
    ///
    /// Matching is case-sensitive on the trimmed text: either the whole text
    /// is the trigger, or the trigger is followed by whitespace
    /// (`"tool please"` selects [`Scenario::Tool`], `"tools"` does not).
    #[must_use]
    pub fn from_prompt(text: &str) -> Self {
        let trimmed = text.trim();
        TRIGGERS
            .iter()
            .find(|(trigger, _)| {
                trimmed
                    .strip_prefix(trigger)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
            })
            .map_or_else(|| Self::Echo(trimmed.to_owned()), |(_, s)| s.clone())
    }

    /// Short name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Tool => "tool",
            Self::Permission => "permission",
            Self::Refuse => "refuse",
            Self::Stream => "stream",
            Self::Clear => "clear",
            Self::Echo(_) => "echo",
        }
    }
}
