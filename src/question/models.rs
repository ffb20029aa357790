use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicModel {
    pub id: Uuid,
    pub name: String,
}

impl TopicModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QuestionKind {
    /// Numeric entry
    Num,
    /// Multiple choice
    Mcq,
    /// Free-text
    Wri,
}

/// The single correct-answer record of a question, shaped by its kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerPayload {
    MultipleChoice {
        option_a: String,
        option_b: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        option_c: Option<String>,
        correct_answer: String,
    },
    Numeric {
        correct_answer: f64,
    },
    FreeText {
        correct_answer: String,
    },
}

impl AnswerPayload {
    pub fn kind(&self) -> QuestionKind {
        match self {
            AnswerPayload::MultipleChoice { .. } => QuestionKind::Mcq,
            AnswerPayload::Numeric { .. } => QuestionKind::Num,
            AnswerPayload::FreeText { .. } => QuestionKind::Wri,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionModel {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub text: String,
    pub difficulty: i16,
    pub answer: AnswerPayload,
}

impl QuestionModel {
    pub fn new(topic_id: Uuid, text: impl Into<String>, difficulty: i16, answer: AnswerPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic_id,
            text: text.into(),
            difficulty,
            answer,
        }
    }

    pub fn kind(&self) -> QuestionKind {
        self.answer.kind()
    }

    pub fn to_payload(&self) -> QuestionPayload {
        QuestionPayload {
            question_id: self.id,
            question: self.text.clone(),
            difficulty: self.difficulty,
            kind: self.kind(),
            answer: self.answer.clone(),
        }
    }
}

/// Wire shape of a question inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionPayload {
    pub question_id: Uuid,
    pub question: String,
    pub difficulty: i16,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub answer: AnswerPayload,
}
