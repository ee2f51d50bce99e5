//! In-memory collaborators for tests: a record store and a scripted client.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm_client::{ClientError, ClientErrorReason, TextGenerationClient};
use crate::models::record::{Record, RecordId};
use crate::repository::{RecordRepository, RepositoryError};
use crate::transform::payload::escape_xml;

/// Record store over a `Vec`, with revision checks like the Postgres store.
pub struct InMemoryRepository {
    records: Mutex<Vec<Record>>,
    conflicts: Mutex<HashSet<RecordId>>,
}

impl InMemoryRepository {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: Mutex::new(records),
            conflicts: Mutex::new(HashSet::new()),
        }
    }

    pub fn get(&self, id: RecordId) -> Option<Record> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Makes every later persist of `id` fail with `ConcurrentModification`.
    pub fn fail_persist(&self, id: RecordId) {
        self.conflicts.lock().unwrap().insert(id);
    }
}

#[async_trait]
impl RecordRepository for InMemoryRepository {
    async fn fetch(&self, id: RecordId) -> Result<Record, RepositoryError> {
        self.get(id).ok_or(RepositoryError::NotFound(id))
    }

    async fn fetch_all_of_type(&self, record_type: &str) -> Result<Vec<Record>, RepositoryError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.record_type == record_type)
            .cloned()
            .collect())
    }

    async fn persist(&self, record: &Record) -> Result<(), RepositoryError> {
        if self.conflicts.lock().unwrap().contains(&record.id) {
            return Err(RepositoryError::ConcurrentModification(record.id));
        }
        let mut records = self.records.lock().unwrap();
        let stored = records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or(RepositoryError::NotFound(record.id))?;
        if stored.revision != record.revision {
            return Err(RepositoryError::ConcurrentModification(record.id));
        }
        *stored = record.clone();
        stored.revision += 1;
        Ok(())
    }
}

/// Returns queued replies in order and records every prompt it receives.
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Result<String, ClientError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new(replies: Vec<Result<String, ClientError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerationClient for ScriptedClient {
    fn id(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, prompt: &str, _timeout: Duration) -> Result<String, ClientError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(ClientError::new(
                ClientErrorReason::Unknown,
                "no scripted reply left",
            ))
        })
    }
}

/// Renders a well-formed reply with the given field values per record.
pub fn reply_xml(records: &[(RecordId, Vec<(&str, &str)>)]) -> String {
    let mut out = String::from("<records type=\"Vocab\">\n");
    for (id, fields) in records {
        out.push_str(&format!("  <record id=\"{id}\" container=\"Test\">\n"));
        for (name, content) in fields {
            out.push_str(&format!(
                "    <field name=\"{}\">{}</field>\n",
                escape_xml(name),
                escape_xml(content)
            ));
        }
        out.push_str("  </record>\n");
    }
    out.push_str("</records>");
    out
}
