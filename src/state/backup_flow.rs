use crate::inventory::{self, AutoSelection};
use crate::settings::BackupProfile;
use crate::types::{BackupResult, ContainerDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRole {
    App,
    Database,
}

impl ContainerRole {
    pub fn label(&self) -> &'static str {
        match self {
            ContainerRole::App => "application",
            ContainerRole::Database => "database",
        }
    }

    pub fn token<'a>(&self, profile: &'a BackupProfile) -> &'a str {
        match self {
            ContainerRole::App => &profile.app_role,
            ContainerRole::Database => &profile.db_role,
        }
    }
}

/// Scan results, container choices and the outcome of the last run.
#[derive(Debug, Default)]
pub struct BackupFlow {
    pub containers: Vec<ContainerDescriptor>,
    pub app_index: Option<usize>,
    pub db_index: Option<usize>,
    /// Containers offered when the app role was not matched uniquely.
    pub app_candidates: Vec<usize>,
    pub db_candidates: Vec<usize>,
    pub last_result: Option<BackupResult>,
    pub remote_archive_deleted: bool,
}

impl BackupFlow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the scan and re-runs auto-selection for both roles.
    ///
    /// The last run's result survives, so its server copy can still be deleted.
    pub fn apply_scan(&mut self, containers: Vec<ContainerDescriptor>, profile: &BackupProfile) {
        *self = Self {
            containers,
            last_result: self.last_result.take(),
            remote_archive_deleted: self.remote_archive_deleted,
            ..Self::default()
        };
        for role in [ContainerRole::App, ContainerRole::Database] {
            let (index, candidates) = self.auto_select(role, role.token(profile));
            match role {
                ContainerRole::App => {
                    self.app_index = index;
                    self.app_candidates = candidates;
                }
                ContainerRole::Database => {
                    self.db_index = index;
                    self.db_candidates = candidates;
                }
            }
        }
    }

    fn auto_select(&self, role: ContainerRole, token: &str) -> (Option<usize>, Vec<usize>) {
        let position = |c: &ContainerDescriptor| self.containers.iter().position(|x| x.id == c.id);
        match inventory::auto_select(&self.containers, token) {
            AutoSelection::Unique(c) => (position(c), Vec::new()),
            AutoSelection::Ambiguous(all) => {
                tracing::info!(role = role.label(), matches = all.len(), "Several containers match");
                (None, all.into_iter().filter_map(position).collect())
            }
            AutoSelection::NoMatch => (None, (0..self.containers.len()).collect()),
        }
    }

    pub fn candidates(&self, role: ContainerRole) -> Vec<&ContainerDescriptor> {
        let indices = match role {
            ContainerRole::App => &self.app_candidates,
            ContainerRole::Database => &self.db_candidates,
        };
        indices.iter().filter_map(|&i| self.containers.get(i)).collect()
    }

    pub fn selected(&self, role: ContainerRole) -> Option<&ContainerDescriptor> {
        let index = match role {
            ContainerRole::App => self.app_index,
            ContainerRole::Database => self.db_index,
        };
        index.and_then(|i| self.containers.get(i))
    }

    /// Selects the `choice`-th offered candidate for `role`.
    pub fn choose_candidate(&mut self, role: ContainerRole, choice: usize) -> bool {
        let index = match role {
            ContainerRole::App => self.app_candidates.get(choice).copied(),
            ContainerRole::Database => self.db_candidates.get(choice).copied(),
        };
        index.is_some_and(|i| self.select(role, i))
    }

    /// Selects by position in the full scan.
    pub fn select(&mut self, role: ContainerRole, index: usize) -> bool {
        if index >= self.containers.len() {
            return false;
        }
        match role {
            ContainerRole::App => self.app_index = Some(index),
            ContainerRole::Database => self.db_index = Some(index),
        }
        true
    }

    /// Selects the container whose name or id is exactly `name`.
    pub fn select_by_name(&mut self, role: ContainerRole, name: &str) -> bool {
        let found = inventory::find_by_name(&self.containers, name)
            .and_then(|c| self.containers.iter().position(|x| x.id == c.id));
        match found {
            Some(index) => self.select(role, index),
            None => false,
        }
    }

    /// Remote archive of the last run, unless it has been deleted.
    pub fn remote_archive(&self) -> Option<&str> {
        if self.remote_archive_deleted {
            return None;
        }
        self.last_result
            .as_ref()
            .and_then(|r| r.archive_remote_path.as_deref())
    }
}
