//! ReactiveRecord - live queries and optimistic writes for one entity type

use recordstore::Record;
use serde_json::Value;
use tracing::debug;

use super::coordinator::{CoordinatorConfig, ReactiveCoordinator};
use super::query::ReactiveQuery;
use super::retry::RetryPolicy;
use crate::connection::Connection;
use crate::error::RecordResult;
use crate::model::ActiveRecord;
use crate::mutation::Patch;
use crate::query::ScopedQuery;

/// Reactive façade over an [`ActiveRecord`]
pub struct ReactiveRecord<T> {
    model: ActiveRecord<T>,
    retry: RetryPolicy,
    coordinator: CoordinatorConfig,
}

impl<T> Clone for ReactiveRecord<T> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            retry: self.retry.clone(),
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<T: Record> ReactiveRecord<T> {
    pub fn new(conn: Connection) -> RecordResult<Self> {
        Ok(Self::from_model(ActiveRecord::new(conn)?))
    }

    pub fn from_model(model: ActiveRecord<T>) -> Self {
        Self {
            model,
            retry: RetryPolicy::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_coordinator_config(mut self, config: CoordinatorConfig) -> Self {
        self.coordinator = config;
        self
    }

    pub fn model(&self) -> &ActiveRecord<T> {
        &self.model
    }

    /// Live default scope
    pub fn all(&self) -> ReactiveQuery<T> {
        self.query(self.model.all())
    }

    pub fn kept(&self) -> ReactiveQuery<T> {
        self.query(self.model.kept())
    }

    pub fn discarded(&self) -> ReactiveQuery<T> {
        self.query(self.model.discarded())
    }

    pub fn with_discarded(&self) -> ReactiveQuery<T> {
        self.query(self.model.with_discarded())
    }

    pub fn where_eq(&self, field: &str, value: impl Into<Value>) -> ReactiveQuery<T> {
        self.query(self.model.where_eq(field, value))
    }

    /// Live collection over an arbitrary scope
    pub fn query(&self, scope: ScopedQuery<T>) -> ReactiveQuery<T> {
        debug!(table = scope.schema().table, "ReactiveRecord::query: called");
        ReactiveQuery::many(scope, self.retry.clone())
    }

    /// Live single record by id (discarded or not)
    pub fn find(&self, id: &str) -> ReactiveQuery<T> {
        debug!(table = self.model.schema().table, %id, "ReactiveRecord::find: called");
        let pk = self.model.schema().primary_key;
        ReactiveQuery::one(self.model.with_discarded().where_eq(pk, id), self.retry.clone())
    }

    /// Live first match of a scope
    pub fn first(&self, scope: ScopedQuery<T>) -> ReactiveQuery<T> {
        ReactiveQuery::one(scope, self.retry.clone())
    }

    /// Coordinate `query` with this façade's coordinator config
    pub fn coordinate(&self, query: ReactiveQuery<T>) -> ReactiveCoordinator<T> {
        ReactiveCoordinator::new(query, self.coordinator.clone())
    }

    /// Update `id`, showing the change in `query` before the backend confirms
    ///
    /// The local change is rolled back if the write fails.
    pub async fn update_optimistic(&self, query: &ReactiveQuery<T>, id: &str, patch: Patch) -> RecordResult<T> {
        debug!(table = self.model.schema().table, %id, "ReactiveRecord::update_optimistic: called");
        let token = query.apply_optimistic(id, patch.clone())?;
        match self.model.update(id, patch).await {
            Ok(record) => {
                query.confirm(token);
                Ok(record)
            }
            Err(e) => {
                query.rollback(token);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Job, JobStatus, NewJob};
    use recordstore::{MemoryBackend, generate_id};
    use std::sync::Arc;

    fn jobs() -> ReactiveRecord<Job> {
        ReactiveRecord::new(Connection::connected(Arc::new(MemoryBackend::new())))
            .unwrap()
            .with_retry(RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_find_tracks_single_record() {
        let jobs = jobs();
        let job = jobs.model().create(&NewJob::new(generate_id(), "Fix sink")).await.unwrap();
        let live = jobs.find(&job.id);
        let state = live.settled().await.unwrap();
        assert_eq!(state.data.unwrap().as_one().map(|j| j.title.clone()).as_deref(), Some("Fix sink"));

        jobs.model().update(&job.id, Patch::new().set("title", "Fix tap")).await.unwrap();
        let state = live
            .wait_for(|s| s.data.as_ref().and_then(|d| d.as_one()).is_some_and(|j| j.title == "Fix tap"))
            .await
            .unwrap();
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_update_optimistic_success() {
        let jobs = jobs();
        let job = jobs.model().create(&NewJob::new(generate_id(), "Fix sink")).await.unwrap();
        let live = jobs.all();
        live.settled().await.unwrap();

        let updated = jobs
            .update_optimistic(&live, &job.id, Patch::new().set("status", "completed"))
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Completed);
        let state = live
            .wait_for(|s| s.data.as_ref().is_some_and(|d| d.iter().all(|j| j.status == JobStatus::Completed)))
            .await
            .unwrap();
        assert_eq!(state.data.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_optimistic_rolls_back_on_failure() {
        let jobs = jobs();
        let job = jobs.model().create(&NewJob::new(generate_id(), "Fix sink")).await.unwrap();
        let live = jobs.all();
        live.settled().await.unwrap();

        let err = jobs
            .update_optimistic(&live, &job.id, Patch::new().set("title", ""))
            .await
            .unwrap_err();
        assert!(err.is_invalid());
        assert_eq!(live.pending_optimistic(), 0);
        let titles: Vec<String> = live.data().unwrap().iter().map(|j| j.title.clone()).collect();
        assert_eq!(titles, vec!["Fix sink".to_string()]);
    }
}
