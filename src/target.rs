use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::{Mutex, RwLock};
use regex::Regex;

use crate::engine::{ContainerRecord, ContainerStatus};
use crate::options::ResumeToken;

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
pub const COMPOSE_NUMBER_LABEL: &str = "com.docker.compose.container-number";

/// One logical instantiation of a container, scheduled for tailing. The same
/// container id reappears as a new target after a restart, distinguished by
/// its start timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub id: String,
    /// Display name with the leading `/` stripped.
    pub name: String,
    /// Compose service label when present, otherwise the display name.
    pub service: String,
    pub compose_project: String,
    pub container_number: String,
    pub tty: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// True when this identifier passed the filter before, under any start
    /// time.
    pub seen_previously: bool,
    /// Position handed back by a previous tail of the same identifier.
    pub resume: Option<ResumeToken>,
}

#[derive(Debug, Default)]
pub struct FilterConfig {
    pub name: Vec<Regex>,
    pub name_exclude: Vec<Regex>,
    pub compose: Vec<Regex>,
    pub image: Vec<Regex>,
}

/// Matches container records against the configured filters and tracks which
/// identifiers are live. Shared between the watcher and every supervising
/// task, so the interior state sits behind locks.
pub struct TargetFilter {
    config: FilterConfig,
    /// id -> last observed start time.
    active: RwLock<HashMap<String, DateTime<Utc>>>,
    seen: Mutex<SeenCache>,
}

impl TargetFilter {
    pub fn new(config: FilterConfig, cache_size: usize) -> Self {
        Self {
            config,
            active: RwLock::new(HashMap::new()),
            seen: Mutex::new(SeenCache::new(cache_size)),
        }
    }

    /// Applies the filters to an inspected container and hands a target to
    /// `emit` when it should be tailed. Rejections short-circuit in filter
    /// order; a record observed twice with the same start time is dropped.
    pub fn visit(&self, record: &ContainerRecord, mut emit: impl FnMut(Target)) {
        let name = record.name.strip_prefix('/').unwrap_or(&record.name);
        let service = record
            .labels
            .get(COMPOSE_SERVICE_LABEL)
            .map(String::as_str)
            .unwrap_or(name);
        let compose_project = record
            .labels
            .get(COMPOSE_PROJECT_LABEL)
            .cloned()
            .unwrap_or_default();
        let container_number = record
            .labels
            .get(COMPOSE_NUMBER_LABEL)
            .cloned()
            .unwrap_or_default();

        if !self.config.name.is_empty() && !self.config.name.iter().any(|re| re.is_match(service)) {
            return;
        }
        // An empty compose project always fails a non-empty compose filter.
        if !self.config.compose.is_empty()
            && !self
                .config
                .compose
                .iter()
                .any(|re| re.is_match(&compose_project))
        {
            return;
        }
        if !self.config.image.is_empty()
            && !self.config.image.iter().any(|re| re.is_match(&record.image))
        {
            return;
        }
        if self.config.name_exclude.iter().any(|re| re.is_match(service)) {
            return;
        }

        // Freshly created containers have no logs yet; the start event will
        // bring them back once they run.
        if record.status == ContainerStatus::Created {
            return;
        }

        let started_at = match DateTime::parse_from_rfc3339(&record.started_at) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => {
                debug!("ignoring container {}: bad start time: {e}", record.id);
                return;
            }
        };
        let finished_at = DateTime::parse_from_rfc3339(&record.finished_at)
            .ok()
            .map(|t| t.with_timezone(&Utc));

        if !self.should_add(&record.id, started_at) {
            return;
        }

        let (seen_previously, resume) = self.seen.lock().touch(&record.id);

        emit(Target {
            id: record.id.clone(),
            name: name.to_string(),
            service: service.to_string(),
            compose_project,
            container_number,
            tty: record.tty,
            started_at,
            finished_at,
            seen_previously,
            resume,
        });
    }

    /// Records the start time for an id, returning false when the same
    /// logical instance was observed before. Read and write happen under one
    /// write lock so concurrent visits cannot both claim a target.
    fn should_add(&self, id: &str, started_at: DateTime<Utc>) -> bool {
        let mut active = self.active.write();
        let previous = active.insert(id.to_string(), started_at);
        previous != Some(started_at)
    }

    /// Drops an id from the active set. Called on the engine's die event.
    pub fn inactive(&self, id: &str) {
        self.active.write().remove(id);
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.read().contains_key(id)
    }

    /// Remembers the position a finished tail reached, for the next
    /// instantiation of the same identifier.
    pub fn set_resume_request(&self, id: &str, token: ResumeToken) {
        self.seen.lock().set_resume(id, token);
    }

    /// Evicts an id from the seen cache. Called on the engine's destroy
    /// event.
    pub fn forget(&self, id: &str) {
        self.seen.lock().forget(id);
    }
}

/// Bounded LRU of identifiers this run has tailed before, each optionally
/// holding the resume token its last tail handed back. Eviction only risks
/// re-printing lines from that one container.
struct SeenCache {
    map: HashMap<String, (Option<ResumeToken>, u64)>,
    counter: u64,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            counter: 0,
            capacity: capacity.max(1),
        }
    }

    /// Marks an id seen and takes any stored resume token.
    fn touch(&mut self, id: &str) -> (bool, Option<ResumeToken>) {
        self.counter += 1;
        match self.map.get_mut(id) {
            Some((token, order)) => {
                *order = self.counter;
                (true, token.take())
            }
            None => {
                if self.map.len() >= self.capacity {
                    self.evict_oldest();
                }
                self.map.insert(id.to_string(), (None, self.counter));
                (false, None)
            }
        }
    }

    fn set_resume(&mut self, id: &str, token: ResumeToken) {
        self.counter += 1;
        if self.map.len() >= self.capacity && !self.map.contains_key(id) {
            self.evict_oldest();
        }
        self.map.insert(id.to_string(), (Some(token), self.counter));
    }

    fn forget(&mut self, id: &str) {
        self.map.remove(id);
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .map
            .iter()
            .min_by_key(|(_, (_, order))| *order)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::engine::ContainerStatus;

    const VALID_TIME: &str = "2000-01-01T00:00:00+00:00";

    fn record(compose: &str, id: &str, name: &str, image: &str) -> ContainerRecord {
        let mut labels = HashMap::new();
        let mut json_name = format!("/{name}");
        if !compose.is_empty() {
            labels.insert(COMPOSE_PROJECT_LABEL.to_string(), compose.to_string());
            labels.insert(COMPOSE_SERVICE_LABEL.to_string(), name.to_string());
            json_name = format!("/{name}-0");
        }
        ContainerRecord {
            id: id.to_string(),
            name: json_name,
            image: image.to_string(),
            labels,
            tty: false,
            status: ContainerStatus::Running,
            started_at: VALID_TIME.to_string(),
            finished_at: String::new(),
        }
    }

    fn regexes(patterns: &[&str]) -> Vec<Regex> {
        patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
    }

    fn collect_visits(filter: &TargetFilter, records: &[ContainerRecord]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for record in records {
            filter.visit(record, |t| out.push((t.id.clone(), t.service.clone())));
        }
        out
    }

    fn fleet() -> Vec<ContainerRecord> {
        vec![
            record("", "id1", "container1", "image1"),
            record("", "id2", "container2", "image1"),
            record("compose1", "id3", "container1", "image1"),
            record("compose1", "id4", "container2", "image2"),
            record("compose2", "id5", "container1", "image2"),
            record("compose2", "id6", "container2", "image2"),
        ]
    }

    #[test]
    fn test_visit_matches_everything_with_empty_filters() {
        let filter = TargetFilter::new(FilterConfig::default(), 10);
        assert_eq!(collect_visits(&filter, &fleet()).len(), 6);
    }

    #[test]
    fn test_visit_filters_by_service_name() {
        let filter = TargetFilter::new(
            FilterConfig {
                name: regexes(&["container1"]),
                ..Default::default()
            },
            10,
        );
        let ids: Vec<String> = collect_visits(&filter, &fleet())
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["id1", "id3", "id5"]);
    }

    #[test]
    fn test_visit_name_filter_uses_service_not_display_name() {
        // Compose containers match on the service label, not the
        // numbered display name.
        let filter = TargetFilter::new(
            FilterConfig {
                name: regexes(&["container1-0"]),
                ..Default::default()
            },
            10,
        );
        assert!(collect_visits(&filter, &fleet()).is_empty());
    }

    #[test]
    fn test_visit_filters_by_exclude() {
        let filter = TargetFilter::new(
            FilterConfig {
                name_exclude: regexes(&["not-matched", "container1"]),
                ..Default::default()
            },
            10,
        );
        let ids: Vec<String> = collect_visits(&filter, &fleet())
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["id2", "id4", "id6"]);
    }

    #[test]
    fn test_visit_filters_by_image() {
        let filter = TargetFilter::new(
            FilterConfig {
                image: regexes(&["image1"]),
                ..Default::default()
            },
            10,
        );
        let ids: Vec<String> = collect_visits(&filter, &fleet())
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["id1", "id2", "id3"]);
    }

    #[test]
    fn test_visit_filters_by_compose_project() {
        let filter = TargetFilter::new(
            FilterConfig {
                compose: regexes(&["compose1"]),
                ..Default::default()
            },
            10,
        );
        let ids: Vec<String> = collect_visits(&filter, &fleet())
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        // Containers without a compose project fail a non-empty filter.
        assert_eq!(ids, vec!["id3", "id4"]);
    }

    #[test]
    fn test_visit_rejects_created_containers() {
        let filter = TargetFilter::new(FilterConfig::default(), 10);
        let mut created = record("", "id1", "container1", "image1");
        created.status = ContainerStatus::Created;
        assert!(collect_visits(&filter, &[created]).is_empty());
    }

    #[test]
    fn test_visit_rejects_unparsable_start_time() {
        let filter = TargetFilter::new(FilterConfig::default(), 10);
        let mut broken = record("", "id1", "container1", "image1");
        broken.started_at = "not a time".to_string();
        assert!(collect_visits(&filter, &[broken]).is_empty());
    }

    #[test]
    fn test_same_instance_is_emitted_at_most_once() {
        let filter = TargetFilter::new(FilterConfig::default(), 10);
        let r = record("", "id1", "c1", "image1");
        assert_eq!(collect_visits(&filter, &[r.clone()]).len(), 1);
        assert_eq!(collect_visits(&filter, &[r]).len(), 0);
    }

    #[test]
    fn test_restart_with_new_start_time_is_emitted_again() {
        let filter = TargetFilter::new(FilterConfig::default(), 10);
        let first = record("", "id1", "c1", "image1");
        let mut second = first.clone();
        second.started_at = "2000-01-01T00:00:01+00:00".to_string();

        let mut targets = Vec::new();
        filter.visit(&first, |t| targets.push(t));
        filter.visit(&second, |t| targets.push(t));

        assert_eq!(targets.len(), 2);
        assert!(!targets[0].seen_previously);
        assert!(targets[1].seen_previously);
    }

    #[test]
    fn test_inactive_allows_the_same_instance_again() {
        let filter = TargetFilter::new(FilterConfig::default(), 10);
        let r = record("", "id2", "c2", "image1");
        let mut targets = Vec::new();
        filter.visit(&r, |t| targets.push(t));
        filter.inactive("id2");
        filter.visit(&r, |t| targets.push(t));

        assert_eq!(targets.len(), 2);
        assert!(targets[1].seen_previously);
    }

    #[test]
    fn test_restart_carries_stored_resume_token() {
        let filter = TargetFilter::new(FilterConfig::default(), 10);
        let first = record("", "id1", "c1", "image1");
        let mut targets = Vec::new();
        filter.visit(&first, |t| targets.push(t));
        assert_eq!(targets[0].resume, None);

        filter.set_resume_request(
            "id1",
            ResumeToken {
                timestamp: "2000-01-01T00:00:09Z".to_string(),
                lines_to_skip: 3,
            },
        );
        filter.inactive("id1");

        let mut second = first.clone();
        second.started_at = "2000-01-01T00:00:10+00:00".to_string();
        filter.visit(&second, |t| targets.push(t));

        assert_eq!(
            targets[1].resume,
            Some(ResumeToken {
                timestamp: "2000-01-01T00:00:09Z".to_string(),
                lines_to_skip: 3,
            })
        );
    }

    #[test]
    fn test_forget_evicts_the_resume_token() {
        let filter = TargetFilter::new(FilterConfig::default(), 10);
        let first = record("", "id1", "c1", "image1");
        filter.visit(&first, |_| {});
        filter.set_resume_request(
            "id1",
            ResumeToken {
                timestamp: "2000-01-01T00:00:09Z".to_string(),
                lines_to_skip: 3,
            },
        );
        filter.forget("id1");
        filter.inactive("id1");

        let mut targets = Vec::new();
        filter.visit(&first, |t| targets.push(t));
        assert_eq!(targets[0].resume, None);
        assert!(!targets[0].seen_previously);
    }

    #[test]
    fn test_is_active_tracks_visit_and_inactive() {
        let filter = TargetFilter::new(FilterConfig::default(), 10);
        assert!(!filter.is_active("id1"));
        filter.visit(&record("", "id1", "c1", "image1"), |_| {});
        assert!(filter.is_active("id1"));
        filter.inactive("id1");
        assert!(!filter.is_active("id1"));
    }

    #[test]
    fn test_seen_cache_evicts_least_recently_used() {
        let mut cache = SeenCache::new(2);
        cache.touch("a");
        cache.touch("b");
        cache.touch("a");
        cache.touch("c"); // evicts b
        assert!(cache.touch("b") == (false, None));
    }

    #[test]
    fn test_compose_target_fields() {
        let filter = TargetFilter::new(FilterConfig::default(), 10);
        let mut r = record("app", "id9", "web", "image1");
        r.labels
            .insert(COMPOSE_NUMBER_LABEL.to_string(), "1".to_string());
        let mut targets = Vec::new();
        filter.visit(&r, |t| targets.push(t));

        let target = &targets[0];
        assert_eq!(target.name, "web-0");
        assert_eq!(target.service, "web");
        assert_eq!(target.compose_project, "app");
        assert_eq!(target.container_number, "1");
    }
}
