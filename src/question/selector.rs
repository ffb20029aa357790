use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{models::QuestionModel, repository::QuestionRepository};
use crate::shared::AppError;

/// Maps a tier to the number of questions drawn at each difficulty
#[derive(Debug, Clone)]
pub struct DistributionTable {
    entries: BTreeMap<i16, Vec<(i16, usize)>>,
}

impl DistributionTable {
    pub fn new(entries: BTreeMap<i16, Vec<(i16, usize)>>) -> Self {
        Self { entries }
    }

    pub fn for_tier(&self, tier: i16) -> Option<&[(i16, usize)]> {
        self.entries.get(&tier).map(Vec::as_slice)
    }
}

impl Default for DistributionTable {
    fn default() -> Self {
        Self::new(BTreeMap::from([
            (1, vec![(1, 8), (2, 2)]),
            (2, vec![(1, 2), (2, 6), (3, 2)]),
            (3, vec![(2, 2), (3, 6), (4, 2)]),
            (4, vec![(3, 2), (4, 6), (5, 2)]),
            (5, vec![(4, 2), (5, 8)]),
        ]))
    }
}

pub struct QuestionSelector {
    repository: Arc<dyn QuestionRepository>,
    table: DistributionTable,
}

impl QuestionSelector {
    pub fn new(repository: Arc<dyn QuestionRepository>) -> Self {
        Self::with_table(repository, DistributionTable::default())
    }

    pub fn with_table(repository: Arc<dyn QuestionRepository>, table: DistributionTable) -> Self {
        Self { repository, table }
    }

    /// Draws a shuffled batch of at most `limit` distinct questions for the tier.
    /// A short sub-draw contributes whatever exists; an unknown tier gives an empty batch.
    #[instrument(skip(self))]
    pub async fn select(
        &self,
        topic_id: Uuid,
        tier: i16,
        limit: usize,
    ) -> Result<Vec<QuestionModel>, AppError> {
        let Some(plan) = self.table.for_tier(tier) else {
            debug!(tier, "No distribution entry for tier");
            return Ok(Vec::new());
        };

        let mut seen = HashSet::new();
        let mut batch = Vec::new();
        for &(difficulty, count) in plan {
            let drawn = self
                .repository
                .sample_questions(topic_id, difficulty, count)
                .await?;
            if drawn.len() < count {
                debug!(difficulty, wanted = count, got = drawn.len(), "Short sub-draw");
            }
            batch.extend(drawn.into_iter().filter(|q| seen.insert(q.id)));
        }

        batch.shuffle(&mut rand::rng());
        batch.truncate(limit);

        debug!(selected = batch.len(), "Question batch selected");
        Ok(batch)
    }
}
