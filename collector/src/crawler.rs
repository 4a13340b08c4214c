use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use storage::{DirectoryStore, Row};

use crate::client::{GraphClient, ListPage, PageSource};
use crate::config::{CollectorConfig, RetryConfig};
use crate::error::CollectorResult;
use crate::paginate::{backoff_delay, PagedRows};

/// Outcome of one collection run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub applications: u32,
    pub service_principals: u32,
    pub subresource_rows: u32,
    pub tables_stored: u32,
    pub errors: Vec<SyncError>
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncError {
    pub entity_type: String,
    pub entity_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>
}

impl SyncReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            ..Default::default()
        }
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn add_error(&mut self, entity_type: &str, entity_id: &str, error: impl ToString) {
        self.errors.push(SyncError {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            error: error.to_string(),
            timestamp: Utc::now()
        });
    }
}

/// Traverses the directory and hands each completed table to the store.
///
/// Subresource fetches across all service principals share one semaphore, so
/// at most `concurrency` requests are in flight regardless of batch size.
pub struct GraphCrawler {
    client: Arc<GraphClient>,
    store: Arc<DirectoryStore>,
    config: CollectorConfig,
    limiter: Arc<Semaphore>
}

/// The four per-principal subresource listings, each isolated as its own
/// result so one failure never taints its siblings.
struct SpSubresources {
    sp_id: String,
    app_role_assignments: CollectorResult<Vec<Row>>,
    app_role_assigned_to: CollectorResult<Vec<Row>>,
    oauth_grants: CollectorResult<Vec<Row>>,
    member_of: CollectorResult<Vec<Row>>
}

/// Accumulators for the service-principal traversal and its subresources.
#[derive(Default)]
struct SpTables {
    service_principals: Vec<Row>,
    app_role_assignments: Vec<Row>,
    app_role_assigned_to: Vec<Row>,
    app_roles: Vec<Row>,
    oauth_grants: Vec<Row>,
    member_of: Vec<Row>
}

impl GraphCrawler {
    pub fn new(client: GraphClient, store: Arc<DirectoryStore>, config: CollectorConfig) -> Self {
        let limiter = Arc::new(Semaphore::new(config.concurrency));
        Self {
            client: Arc::new(client),
            store,
            config,
            limiter
        }
    }

    /// Runs a full collection: applications first, then service principals
    /// with their subresources. Isolated fetch failures degrade to empty
    /// data and are recorded in the report; only store faults abort the run.
    pub async fn fetch(&self) -> CollectorResult<SyncReport> {
        let mut report = SyncReport::new();
        info!("Starting collection; this may take a while on a large directory");

        info!("Starting to fetch applications");
        match self.fetch_applications().await {
            Ok(rows) if rows.is_empty() => {
                warn!("applications listing returned no rows");
            }
            Ok(rows) => {
                report.applications = rows.len() as u32;
                self.store.store_table("applications", rows, true).await?;
                report.tables_stored += 1;
            }
            Err(e) => {
                error!(error = %e, "Error fetching applications, skipping table");
                report.add_error("applications", "", &e);
            }
        }

        info!("Starting to fetch service principals");
        match self.fetch_service_principals(&mut report).await {
            Ok(tables) => {
                for (name, rows) in tables.into_tables() {
                    if rows.is_empty() {
                        debug!(table = name, "no rows collected");
                        continue;
                    }
                    let count = rows.len() as u32;
                    self.store.store_table(name, rows, true).await?;
                    info!(table = name, rows = count, "stored records");
                    report.tables_stored += 1;
                }
            }
            Err(e) => {
                error!(error = %e, "Error fetching service principals, skipping tables");
                report.add_error("service_principals", "", &e);
            }
        }

        report.complete();
        info!(
            applications = report.applications,
            service_principals = report.service_principals,
            subresource_rows = report.subresource_rows,
            tables_stored = report.tables_stored,
            errors = report.errors.len(),
            "Collection completed"
        );
        Ok(report)
    }

    async fn fetch_applications(&self) -> CollectorResult<Vec<Row>> {
        let url = format!("{}/applications?$top=999", self.config.graph.graph_base_url);
        let initial = self.fetch_initial(&url).await?;
        let mut pages = PagedRows::new(
            self.client.as_ref(),
            initial,
            self.config.retry.clone(),
            Some(self.limiter.clone())
        );

        let mut rows = Vec::new();
        while let Some(item) = pages.try_next().await? {
            rows.push(Row::from_object(item));
        }
        Ok(rows)
    }

    async fn fetch_service_principals(
        &self,
        report: &mut SyncReport
    ) -> CollectorResult<SpTables> {
        let mut tables = SpTables::default();

        let url = format!(
            "{}/servicePrincipals?$top=999",
            self.config.graph.graph_base_url
        );
        let initial = self.fetch_initial(&url).await?;
        let mut pages = PagedRows::new(
            self.client.as_ref(),
            initial,
            self.config.retry.clone(),
            Some(self.limiter.clone())
        );

        let mut tasks: Vec<JoinHandle<SpSubresources>> = Vec::new();
        let mut counter = 0usize;

        while let Some(item) = pages.try_next().await? {
            extract_app_roles(&item, &mut tables.app_roles);

            let sp_id = item.get("id").and_then(Value::as_str).map(ToString::to_string);
            tables.service_principals.push(Row::from_object(item));
            counter += 1;

            match sp_id {
                Some(sp_id) => {
                    let client = self.client.clone();
                    let limiter = self.limiter.clone();
                    let retry = self.config.retry.clone();
                    let base_url = self.config.graph.graph_base_url.clone();
                    tasks.push(tokio::spawn(async move {
                        fetch_sp_subresources(client, limiter, retry, base_url, sp_id).await
                    }));
                }
                None => warn!("service principal row is missing id, skipping subresources")
            }

            let cap_reached = self.config.debug_count.is_some_and(|cap| counter >= cap);

            if tasks.len() >= self.config.batch_size || cap_reached {
                info!(batch = tasks.len(), "Processing batch of service principals");
                drain_batch(&mut tasks, &mut tables, report).await;
                tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
            }

            if cap_reached {
                debug!(counter, "debug row cap reached, stopping traversal");
                break;
            }
        }

        if !tasks.is_empty() {
            info!(batch = tasks.len(), "Processing final batch of service principals");
            drain_batch(&mut tasks, &mut tables, report).await;
        }

        report.service_principals = tables.service_principals.len() as u32;
        report.subresource_rows = (tables.app_role_assignments.len()
            + tables.app_role_assigned_to.len()
            + tables.oauth_grants.len()
            + tables.member_of.len()) as u32;

        Ok(tables)
    }

    async fn fetch_initial(&self, url: &str) -> CollectorResult<ListPage> {
        let _permit = self.limiter.acquire().await.expect("request limiter closed");
        self.client.fetch_page(url).await
    }
}

impl SpTables {
    fn into_tables(self) -> [(&'static str, Vec<Row>); 6] {
        [
            ("service_principals", self.service_principals),
            ("app_role_assignments", self.app_role_assignments),
            ("app_role_assigned_to", self.app_role_assigned_to),
            ("app_roles", self.app_roles),
            ("sp_oauth_grants", self.oauth_grants),
            ("sp_member_of", self.member_of),
        ]
    }
}

/// Splits the embedded `appRoles` list off a service-principal object into
/// its own rows, tagged with the owning principal.
fn extract_app_roles(item: &Value, app_roles: &mut Vec<Row>) {
    let Some(roles) = item.get("appRoles").and_then(Value::as_array) else {
        return;
    };
    let sp_id = item.get("id").and_then(Value::as_str);
    for role in roles {
        let mut row = Row::from_object(role.clone());
        if let Some(sp_id) = sp_id {
            row.insert("service_principal_id", Value::String(sp_id.to_string()));
        }
        app_roles.push(row);
    }
}

/// Awaits every fan-out task of the current batch and merges the results.
/// A failed subresource contributes an empty collection and a report entry;
/// it never aborts the batch.
async fn drain_batch(
    tasks: &mut Vec<JoinHandle<SpSubresources>>,
    tables: &mut SpTables,
    report: &mut SyncReport
) {
    let joined = join_all(tasks.drain(..)).await;
    for task in joined {
        match task {
            Ok(sub) => {
                merge_subresource(
                    &mut tables.app_role_assignments,
                    "app_role_assignments",
                    &sub.sp_id,
                    sub.app_role_assignments,
                    report
                );
                merge_subresource(
                    &mut tables.app_role_assigned_to,
                    "app_role_assigned_to",
                    &sub.sp_id,
                    sub.app_role_assigned_to,
                    report
                );
                merge_subresource(
                    &mut tables.oauth_grants,
                    "sp_oauth_grants",
                    &sub.sp_id,
                    sub.oauth_grants,
                    report
                );
                merge_subresource(
                    &mut tables.member_of,
                    "sp_member_of",
                    &sub.sp_id,
                    sub.member_of,
                    report
                );
            }
            Err(e) => {
                error!(error = %e, "Error in batch processing");
                report.add_error("service_principal", "", &e);
            }
        }
    }
}

fn merge_subresource(
    dest: &mut Vec<Row>,
    resource: &str,
    sp_id: &str,
    result: CollectorResult<Vec<Row>>,
    report: &mut SyncReport
) {
    match result {
        Ok(rows) => dest.extend(rows),
        Err(e) => {
            warn!(
                resource,
                sp_id,
                error = %e,
                "Subresource fetch failed, substituting empty collection"
            );
            report.add_error(resource, sp_id, &e);
        }
    }
}

async fn fetch_sp_subresources(
    client: Arc<GraphClient>,
    limiter: Arc<Semaphore>,
    retry: RetryConfig,
    base_url: String,
    sp_id: String
) -> SpSubresources {
    let (app_role_assignments, app_role_assigned_to, oauth_grants, member_of) = tokio::join!(
        fetch_subresource_with_retry(
            client.as_ref(),
            &limiter,
            &retry,
            &base_url,
            &sp_id,
            "appRoleAssignments"
        ),
        fetch_subresource_with_retry(
            client.as_ref(),
            &limiter,
            &retry,
            &base_url,
            &sp_id,
            "appRoleAssignedTo"
        ),
        fetch_subresource_with_retry(
            client.as_ref(),
            &limiter,
            &retry,
            &base_url,
            &sp_id,
            "oauth2PermissionGrants"
        ),
        fetch_subresource_with_retry(
            client.as_ref(),
            &limiter,
            &retry,
            &base_url,
            &sp_id,
            "memberOf"
        )
    );

    SpSubresources {
        sp_id,
        app_role_assignments,
        app_role_assigned_to,
        oauth_grants,
        member_of
    }
}

/// Fetches one subresource listing, retrying whole attempts on transient
/// faults. A traversal that already exhausted its per-cursor budget is not
/// retried again here.
async fn fetch_subresource_with_retry(
    source: &dyn PageSource,
    limiter: &Arc<Semaphore>,
    retry: &RetryConfig,
    base_url: &str,
    sp_id: &str,
    resource: &str
) -> CollectorResult<Vec<Row>> {
    let url = format!("{base_url}/servicePrincipals/{sp_id}/{resource}?$top=999");
    let mut attempt: u32 = 0;
    loop {
        match fetch_subresource(source, limiter, retry, &url, sp_id).await {
            Ok(rows) => return Ok(rows),
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                attempt += 1;
                let wait = backoff_delay(attempt);
                warn!(
                    resource,
                    sp_id,
                    attempt,
                    max_retries = retry.max_retries,
                    wait_secs = wait.as_secs(),
                    error = %e,
                    "Subresource fetch error, retrying"
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e)
        }
    }
}

async fn fetch_subresource(
    source: &dyn PageSource,
    limiter: &Arc<Semaphore>,
    retry: &RetryConfig,
    url: &str,
    sp_id: &str
) -> CollectorResult<Vec<Row>> {
    let initial = {
        let _permit = limiter.acquire().await.expect("request limiter closed");
        source.fetch_page(url).await?
    };

    let mut pages = PagedRows::new(source, initial, retry.clone(), Some(limiter.clone()));
    let mut rows = Vec::new();
    while let Some(item) = pages.try_next().await? {
        let mut row = Row::from_object(item);
        row.insert("service_principal_id", Value::String(sp_id.to_string()));
        rows.push(row);
    }
    Ok(rows)
}
