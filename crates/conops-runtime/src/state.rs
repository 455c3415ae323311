// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runtime state introspection: per-project aggregates and per-container
//! detail, parsed from formatted `docker ps` output.

use std::collections::HashMap;

/// Aggregate runtime state for one compose project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectRuntimeState {
    pub container_count: usize,
    pub running_count: usize,
    pub exited_count: usize,
    pub unhealthy_count: usize,
}

impl ProjectRuntimeState {
    /// All tracked service containers are running and healthy.
    pub fn is_healthy(&self) -> bool {
        if self.container_count == 0 {
            return false;
        }
        self.running_count == self.container_count
            && self.exited_count == 0
            && self.unhealthy_count == 0
    }
}

/// Runtime details for one container in a compose project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContainer {
    pub service: String,
    pub name: String,
    pub image: String,
    /// "running" or "exited".
    pub status: String,
    /// "healthy", "unhealthy", "starting", or "" (no healthcheck).
    pub health: String,
    pub ports: String,
}

/// Whether a raw `docker ps` status column means the container is up.
pub fn docker_status_is_running(status: &str) -> bool {
    status.trim().to_lowercase().starts_with("up ")
}

/// Aggregate `docker ps -a` output formatted as
/// `project|oneoff|status` lines into per-project state. One-off (run)
/// containers and unlabelled containers are skipped.
pub fn parse_project_snapshot(output: &str) -> HashMap<String, ProjectRuntimeState> {
    let mut snapshot: HashMap<String, ProjectRuntimeState> = HashMap::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, '|');
        let (Some(project), Some(oneoff), Some(status)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };

        let project = project.trim();
        let oneoff = oneoff.trim();
        let status = status.trim();
        if project.is_empty() || oneoff.eq_ignore_ascii_case("true") || oneoff == "1" {
            continue;
        }

        let state = snapshot.entry(project.to_string()).or_default();
        state.container_count += 1;
        if docker_status_is_running(status) {
            state.running_count += 1;
        } else {
            state.exited_count += 1;
        }
        if status.to_lowercase().contains("(unhealthy)") {
            state.unhealthy_count += 1;
        }
    }

    snapshot
}

/// Parse `docker ps -a` output formatted as
/// `service|image|status|ports|name` lines into container details, sorted by
/// service name.
pub fn parse_project_containers(output: &str) -> Vec<ServiceContainer> {
    let mut containers = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.splitn(5, '|').collect();
        if parts.len() != 5 {
            continue;
        }

        let raw_status = parts[2].trim();
        let lower_status = raw_status.to_lowercase();
        let health = if lower_status.contains("(healthy)") {
            "healthy"
        } else if lower_status.contains("(unhealthy)") {
            "unhealthy"
        } else if lower_status.contains("(health: starting)") {
            "starting"
        } else {
            ""
        };
        let status = if docker_status_is_running(raw_status) {
            "running"
        } else {
            "exited"
        };

        containers.push(ServiceContainer {
            service: parts[0].trim().to_string(),
            image: parts[1].trim().to_string(),
            status: status.to_string(),
            health: health.to_string(),
            ports: parts[3].trim().to_string(),
            name: parts[4].trim().to_string(),
        });
    }

    containers.sort_by(|a, b| a.service.cmp(&b.service));
    containers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_requires_all_running_none_exited_none_unhealthy_and_nonzero() {
        let healthy = ProjectRuntimeState {
            container_count: 2,
            running_count: 2,
            exited_count: 0,
            unhealthy_count: 0,
        };
        assert!(healthy.is_healthy());

        assert!(!ProjectRuntimeState::default().is_healthy());
        assert!(!ProjectRuntimeState {
            container_count: 2,
            running_count: 1,
            exited_count: 1,
            unhealthy_count: 0,
        }
        .is_healthy());
        assert!(!ProjectRuntimeState {
            container_count: 2,
            running_count: 2,
            exited_count: 0,
            unhealthy_count: 1,
        }
        .is_healthy());
    }

    #[test]
    fn snapshot_aggregates_per_project() {
        let output = "\
web|False|Up 3 hours
web|False|Up 2 hours (healthy)
web|False|Exited (1) 5 minutes ago
db|False|Up 3 hours (unhealthy)
|False|Up 1 hour
job|True|Exited (0) 1 minute ago
";
        let snapshot = parse_project_snapshot(output);
        assert_eq!(snapshot.len(), 2);

        let web = snapshot.get("web").unwrap();
        assert_eq!(web.container_count, 3);
        assert_eq!(web.running_count, 2);
        assert_eq!(web.exited_count, 1);
        assert_eq!(web.unhealthy_count, 0);
        assert!(!web.is_healthy());

        let db = snapshot.get("db").unwrap();
        assert_eq!(db.container_count, 1);
        assert_eq!(db.unhealthy_count, 1);
        assert!(!db.is_healthy());
    }

    #[test]
    fn snapshot_skips_oneoff_and_malformed_lines() {
        let output = "\
job|true|Up 1 minute
job|1|Up 1 minute
garbage-line
web|False|Up 1 minute
";
        let snapshot = parse_project_snapshot(output);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("web").unwrap().is_healthy());
    }

    #[test]
    fn containers_parse_health_status_and_sort_by_service() {
        let output = "\
worker|acme/worker:1.2|Up 2 hours|8080/tcp|stack-worker-1
api|acme/api:1.2|Up 2 hours (healthy)|0.0.0.0:80->80/tcp|stack-api-1
cron|acme/cron:1.2|Exited (0) 1 hour ago||stack-cron-1
db|postgres:16|Up 2 hours (health: starting)|5432/tcp|stack-db-1
";
        let containers = parse_project_containers(output);
        assert_eq!(containers.len(), 4);
        assert_eq!(
            containers.iter().map(|c| c.service.as_str()).collect::<Vec<_>>(),
            vec!["api", "cron", "db", "worker"]
        );

        let api = &containers[0];
        assert_eq!(api.status, "running");
        assert_eq!(api.health, "healthy");
        assert_eq!(api.ports, "0.0.0.0:80->80/tcp");
        assert_eq!(api.name, "stack-api-1");

        let cron = &containers[1];
        assert_eq!(cron.status, "exited");
        assert_eq!(cron.health, "");

        let db = &containers[2];
        assert_eq!(db.health, "starting");
    }

    #[test]
    fn status_detection_is_case_insensitive_and_prefix_based() {
        assert!(docker_status_is_running("Up 3 hours"));
        assert!(docker_status_is_running("up 2 seconds (healthy)"));
        assert!(!docker_status_is_running("Exited (0) 2 hours ago"));
        assert!(!docker_status_is_running("Created"));
        assert!(!docker_status_is_running("Restarting (1) 2 seconds ago"));
    }
}
