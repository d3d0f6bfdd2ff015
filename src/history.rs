use log::debug;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

/// One question and the answer it got
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

/// Recent exchanges per conversation, kept in memory.
///
/// Each conversation holds at most `max_turns` question/answer pairs; the
/// oldest pair is dropped when a new one arrives. A limit of zero disables
/// history altogether.
#[derive(Debug)]
pub struct ChatHistory {
    max_turns: usize,
    conversations: Mutex<HashMap<String, VecDeque<Turn>>>,
}

impl ChatHistory {
    pub fn new(max_turns: usize) -> Self {
        ChatHistory {
            max_turns,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Turns of `conversation`, oldest first
    pub async fn turns(&self, conversation: &str) -> Vec<Turn> {
        self.conversations
            .lock()
            .await
            .get(conversation)
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn record(&self, conversation: &str, turn: Turn) {
        if self.max_turns == 0 {
            return;
        }

        let mut conversations = self.conversations.lock().await;
        let turns = conversations.entry(conversation.to_string()).or_default();
        turns.push_back(turn);
        while turns.len() > self.max_turns {
            turns.pop_front();
        }
        debug!("Conversation {} holds {} turns", conversation, turns.len());
    }

    pub async fn clear(&self, conversation: &str) {
        self.conversations.lock().await.remove(conversation);
    }
}
