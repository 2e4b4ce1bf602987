use std::collections::HashMap;
use std::time::Instant;

use mdns_types::protocol::types::RecordKey;

use crate::MIN_QUESTION_INTERVAL;

/// The set of record sets this host currently wants answers for, each
/// reference-counted by the queries that need it.  Holding one entry
/// per key is what collapses several clients' interest in the same
/// records into a single stream of outbound questions.
#[derive(Debug, Default)]
pub struct QuestionRegistry {
    questions: HashMap<RecordKey, Question>,
}

#[derive(Debug)]
struct Question {
    refcount: u32,
    last_sent: Option<Instant>,
}

impl QuestionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a key.  Returns true when this is a new
    /// question, false when an existing one gained a reference.
    pub fn add(&mut self, key: &RecordKey) -> bool {
        match self.questions.get_mut(key) {
            Some(question) => {
                question.refcount += 1;
                false
            }
            None => {
                tracing::debug!(%key, "new question");
                self.questions.insert(
                    key.clone(),
                    Question {
                        refcount: 1,
                        last_sent: None,
                    },
                );
                true
            }
        }
    }

    /// Drop one reference.  Returns true when the question was
    /// removed outright.
    pub fn release(&mut self, key: &RecordKey) -> bool {
        if let Some(question) = self.questions.get_mut(key) {
            question.refcount -= 1;
            if question.refcount == 0 {
                tracing::debug!(%key, "question released");
                self.questions.remove(key);
                return true;
            }
        }
        false
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.questions.contains_key(key)
    }

    /// Whether a transmission of this question is due.  Queries share
    /// questions, so one query's transmission suppresses another's
    /// for [`MIN_QUESTION_INTERVAL`].
    pub fn should_send(&self, key: &RecordKey, now: Instant) -> bool {
        match self.questions.get(key) {
            Some(question) => match question.last_sent {
                Some(last) => now.duration_since(last) >= MIN_QUESTION_INTERVAL,
                None => true,
            },
            None => false,
        }
    }

    pub fn mark_sent(&mut self, key: &RecordKey, now: Instant) {
        if let Some(question) = self.questions.get_mut(key) {
            question.last_sent = Some(now);
        }
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}
