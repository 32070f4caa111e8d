//! MongoDB task repository.
//!
//! Documents live in the `tasks` collection keyed by the `id` field (a
//! unique index is created at startup). CAS transitions are expressed as
//! filtered `find_one_and_update` calls: the filter carries the allowed
//! current statuses, so the swap is atomic per document.

use std::future::IntoFuture;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use serde_json::Value;

use skalds_core::{SkaldId, Task, TaskId, TaskLifecycleStatus};

use crate::error::{Error, Result};

use super::{CasOutcome, TaskFilter, TaskPage, TaskRepository, validate_cas_request};

const COLLECTION: &str = "tasks";
const DUPLICATE_KEY: i32 = 11_000;

/// Default per-operation deadline for store calls.
pub const DEFAULT_STORE_OP_TIMEOUT: Duration = Duration::from_secs(3);

/// MongoDB implementation of [`TaskRepository`].
#[derive(Clone)]
pub struct MongoTaskRepository {
    client: Client,
    tasks: Collection<Task>,
    op_timeout: Duration,
}

impl std::fmt::Debug for MongoTaskRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoTaskRepository")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl MongoTaskRepository {
    /// Connects to MongoDB and bootstraps the tasks collection indexes.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or index bootstrap fails;
    /// startup treats this as fatal.
    pub async fn connect(url: &str, db_name: &str, op_timeout: Duration) -> Result<Self> {
        let client = Client::with_uri_str(url)
            .await
            .map_err(|e| Error::repository_with_source(format!("failed to connect to {url}"), e))?;
        let tasks = client.database(db_name).collection::<Task>(COLLECTION);

        let repo = Self {
            client,
            tasks,
            op_timeout,
        };
        repo.init_indexes().await?;
        Ok(repo)
    }

    async fn init_indexes(&self) -> Result<()> {
        let unique_id = IndexModel::builder()
            .keys(doc! { "id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        let by_status = IndexModel::builder()
            .keys(doc! { "lifecycleStatus": 1 })
            .build();
        self.bounded("create_indexes", async {
            self.tasks
                .create_indexes([unique_id, by_status])
                .await
                .map(|_| ())
        })
        .await
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: IntoFuture<Output = mongodb::error::Result<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Error::repository_with_source(
                format!("{operation} failed"),
                err,
            )),
            Err(_) => Err(Error::repository(format!("{operation} timed out"))),
        }
    }

    fn filter_document(filter: &TaskFilter) -> mongodb::bson::Document {
        let mut document = doc! {};
        if !filter.statuses.is_empty() {
            let statuses: Vec<String> = filter.statuses.iter().map(ToString::to_string).collect();
            document.insert("lifecycleStatus", doc! { "$in": statuses });
        }
        if let Some(class_name) = &filter.class_name {
            document.insert("className", class_name);
        }
        if let Some(executor) = &filter.executor {
            document.insert("executor", executor.as_str());
        }
        if let Some(id) = &filter.id {
            document.insert("id", id.as_str());
        }
        document
    }
}

#[async_trait]
impl TaskRepository for MongoTaskRepository {
    async fn create_task(&self, task: &Task) -> Result<()> {
        let result = tokio::time::timeout(self.op_timeout, self.tasks.insert_one(task)).await;
        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => {
                if let ErrorKind::Write(WriteFailure::WriteError(write_error)) = &*err.kind {
                    if write_error.code == DUPLICATE_KEY {
                        return Err(Error::Core(skalds_core::Error::already_exists(
                            "task", &task.id,
                        )));
                    }
                }
                Err(Error::repository_with_source("create_task failed", err))
            }
            Err(_) => Err(Error::repository("create_task timed out")),
        }
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        self.bounded(
            "get_task",
            self.tasks.find_one(doc! { "id": id.as_str() }),
        )
        .await
    }

    async fn list_tasks(&self, filter: &TaskFilter, page: u32, page_size: u32) -> Result<TaskPage> {
        let document = Self::filter_document(filter);

        let total = self
            .bounded(
                "count_tasks",
                self.tasks.count_documents(document.clone()),
            )
            .await?;

        let skip = u64::from(page.saturating_sub(1)) * u64::from(page_size);
        let items = self
            .bounded("list_tasks", async {
                let cursor = self
                    .tasks
                    .find(document)
                    .sort(doc! { "createDateTime": 1, "id": 1 })
                    .skip(skip)
                    .limit(i64::from(page_size))
                    .await?;
                cursor.try_collect().await
            })
            .await?;

        Ok(TaskPage { items, total })
    }

    async fn list_monitored_tasks(&self) -> Result<Vec<Task>> {
        self.bounded("list_monitored_tasks", async {
            let cursor = self
                .tasks
                .find(doc! { "lifecycleStatus": { "$in": ["Assigning", "Running"] } })
                .await?;
            cursor.try_collect().await
        })
        .await
    }

    async fn list_dispatchable_tasks(&self) -> Result<Vec<Task>> {
        self.bounded("list_dispatchable_tasks", async {
            let cursor = self
                .tasks
                .find(doc! {
                    "mode": "Passive",
                    "lifecycleStatus": { "$in": ["Created", "Paused"] },
                })
                .sort(doc! { "priority": -1, "createDateTime": 1, "id": 1 })
                .await?;
            cursor.try_collect().await
        })
        .await
    }

    async fn update_lifecycle_status(
        &self,
        id: &TaskId,
        to: TaskLifecycleStatus,
        expected: &[TaskLifecycleStatus],
    ) -> Result<CasOutcome> {
        validate_cas_request(to, expected)?;
        let expected_wire: Vec<String> = expected.iter().map(ToString::to_string).collect();
        let now_millis = chrono::Utc::now().timestamp_millis();

        let updated = self
            .bounded("update_lifecycle_status", async {
                self.tasks
                    .find_one_and_update(
                        doc! {
                            "id": id.as_str(),
                            "lifecycleStatus": { "$in": expected_wire },
                        },
                        doc! { "$set": {
                            "lifecycleStatus": to.to_string(),
                            "updateDateTime": now_millis,
                        } },
                    )
                    .await
            })
            .await?;

        if updated.is_some() {
            return Ok(CasOutcome::Applied);
        }

        // The swap matched nothing: either the task is gone or another
        // writer changed the status first.
        match self.get_task(id).await? {
            None => Ok(CasOutcome::NotFound),
            Some(task) => Ok(CasOutcome::Lost {
                actual: task.lifecycle_status,
            }),
        }
    }

    async fn update_executor(&self, id: &TaskId, executor: Option<SkaldId>) -> Result<()> {
        let now_millis = chrono::Utc::now().timestamp_millis();
        let update = match &executor {
            Some(executor) => doc! { "$set": {
                "executor": executor.as_str(),
                "updateDateTime": now_millis,
            } },
            None => doc! {
                "$set": { "updateDateTime": now_millis },
                "$unset": { "executor": "" },
            },
        };

        let result = self
            .bounded(
                "update_executor",
                self.tasks.update_one(doc! { "id": id.as_str() }, update),
            )
            .await?;
        if result.matched_count == 0 {
            return Err(Error::TaskNotFound { task_id: id.clone() });
        }
        Ok(())
    }

    async fn update_attachments(&self, id: &TaskId, attachments: Value) -> Result<()> {
        skalds_core::model::task::validate_attachments(&attachments).map_err(Error::Core)?;
        let payload = mongodb::bson::to_bson(&attachments)
            .map_err(|e| Error::serialization(format!("attachments payload: {e}")))?;
        let now_millis = chrono::Utc::now().timestamp_millis();

        let result = self
            .bounded(
                "update_attachments",
                self.tasks.update_one(
                    doc! { "id": id.as_str() },
                    doc! { "$set": {
                        "attachments": payload,
                        "updateDateTime": now_millis,
                    } },
                ),
            )
            .await?;
        if result.matched_count == 0 {
            return Err(Error::TaskNotFound { task_id: id.clone() });
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.bounded("ping", async {
            self.client
                .database("admin")
                .run_command(doc! { "ping": 1 })
                .await
                .map(|_| ())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_document_shapes() {
        let filter = TaskFilter {
            statuses: vec![TaskLifecycleStatus::Running],
            class_name: Some("W".to_string()),
            executor: Some(SkaldId::new("s1").unwrap()),
            id: None,
        };
        let document = MongoTaskRepository::filter_document(&filter);
        assert_eq!(
            document.get_document("lifecycleStatus").unwrap(),
            &doc! { "$in": ["Running"] }
        );
        assert_eq!(document.get_str("className").unwrap(), "W");
        assert_eq!(document.get_str("executor").unwrap(), "s1");
        assert!(document.get("id").is_none());
    }

    #[test]
    fn empty_filter_matches_everything() {
        let document = MongoTaskRepository::filter_document(&TaskFilter::default());
        assert!(document.is_empty());
    }
}
