use std::collections::VecDeque;

/// Number of turns kept by default: only the most recent exchange.
pub const DEFAULT_WINDOW: usize = 1;

/// One question and the answer given to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

/// Sliding window over the most recent conversation turns.
///
/// Lives for one query-loop session; nothing is persisted.
#[derive(Debug, Clone)]
pub struct ConversationMemory {
    window: usize,
    turns: VecDeque<Turn>,
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl ConversationMemory {
    /// A window of 0 remembers nothing.
    pub fn new(window: usize) -> Self {
        Self {
            window,
            turns: VecDeque::with_capacity(window),
        }
    }

    /// Append a turn, evicting the oldest ones beyond the window.
    pub fn record(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.window {
            self.turns.pop_front();
        }
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.back()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Render the remembered turns as `Human:` / `Assistant:` lines, oldest
    /// first. Empty when nothing is remembered.
    pub fn render(&self) -> String {
        self.turns
            .iter()
            .map(|t| format!("Human: {}\nAssistant: {}", t.question, t.answer))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
