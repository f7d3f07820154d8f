//! Turns selected containers and options into an ordered, validated plan.

use std::path::Path;

use chrono::{DateTime, Local};
use rand::Rng;
use tracing::info;

use crate::error::PlanValidationError;
use crate::remote::sh_quote;
use crate::settings::BackupProfile;
use crate::types::{BackupOptions, BackupPlan, ContainerDescriptor, Step, StepKind};

pub const DATABASE_DIR: &str = "database";
pub const MEDIA_DIR: &str = "media";
pub const OTHER_FILES_DIR: &str = "other-files";

pub struct PlanBuilder {
    profile: BackupProfile,
}

impl PlanBuilder {
    pub fn new(profile: BackupProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &BackupProfile {
        &self.profile
    }

    /// Validates every precondition, then emits the full plan. Never returns a partial plan.
    pub fn build(
        &self,
        db_container: Option<&ContainerDescriptor>,
        app_container: Option<&ContainerDescriptor>,
        options: &BackupOptions,
    ) -> Result<BackupPlan, PlanValidationError> {
        self.build_at(db_container, app_container, options, Local::now())
    }

    pub fn build_at(
        &self,
        db_container: Option<&ContainerDescriptor>,
        app_container: Option<&ContainerDescriptor>,
        options: &BackupOptions,
        now: DateTime<Local>,
    ) -> Result<BackupPlan, PlanValidationError> {
        let db = db_container.ok_or(PlanValidationError::MissingContainer("database"))?;
        let app = app_container.ok_or(PlanValidationError::MissingContainer("application"))?;
        self.validate_profile()?;
        let data_root = app.resolve_mount(&self.profile.data_path)?.to_string();
        check_destination(&options.destination)?;

        let suffix: u32 = rand::thread_rng().gen();
        let backup_name = format!(
            "{}_{}_{:08x}",
            self.profile.name_prefix,
            now.format("%Y%m%d_%H%M%S"),
            suffix
        );
        let tmp_root = self.profile.remote_tmp_root.trim_end_matches('/');
        let temp_dir = format!("{tmp_root}/{backup_name}");
        let remote_archive = format!("{tmp_root}/{backup_name}.tar.gz");
        let local_archive = options.destination.join(format!("{backup_name}.tar.gz"));

        let mut steps = vec![
            self.prepare_step(db, app, &temp_dir, options.include_other_files),
            self.dump_step(db, &temp_dir),
            self.media_step(&data_root, &temp_dir),
        ];
        if options.include_other_files {
            steps.push(self.other_files_step(&data_root, &temp_dir));
        }
        steps.push(archive_step(&temp_dir, &remote_archive, options.include_other_files));
        steps.push(Step {
            kind: StepKind::Download,
            commands: Vec::new(),
            artifact: Some(local_archive.display().to_string()),
        });
        steps.push(Step {
            kind: StepKind::Cleanup,
            commands: vec![crate::cleanup::remove_dir_command(&temp_dir)],
            artifact: Some(temp_dir.clone()),
        });

        info!(
            backup = %backup_name,
            app = %app.name,
            db = %db.name,
            steps = steps.len(),
            "Built backup plan"
        );

        Ok(BackupPlan {
            backup_name,
            temp_dir,
            remote_archive,
            local_archive,
            db_container: db.clone(),
            app_container: app.clone(),
            steps,
        })
    }

    fn validate_profile(&self) -> Result<(), PlanValidationError> {
        let p = &self.profile;
        let checks: [(&'static str, &str); 5] = [
            ("remote_tmp_root", &p.remote_tmp_root),
            ("name_prefix", &p.name_prefix),
            ("db_name", &p.db_name),
            ("db_user", &p.db_user),
            ("runtime", &p.runtime),
        ];
        for (field, value) in checks {
            if value.trim().is_empty() {
                return Err(PlanValidationError::InvalidSetting {
                    field,
                    reason: "must not be empty".to_string(),
                });
            }
        }
        if !p.remote_tmp_root.starts_with('/') || p.remote_tmp_root.trim_end_matches('/').is_empty() {
            return Err(PlanValidationError::InvalidSetting {
                field: "remote_tmp_root",
                reason: "must be an absolute directory other than /".to_string(),
            });
        }
        if p.name_prefix.contains('/') {
            return Err(PlanValidationError::InvalidSetting {
                field: "name_prefix",
                reason: "must not contain '/'".to_string(),
            });
        }
        Ok(())
    }

    fn running_check(&self, container: &ContainerDescriptor) -> String {
        format!(
            "test \"$({} inspect -f '{{{{.State.Running}}}}' {} 2>/dev/null)\" = true || {{ echo {} >&2; exit 1; }}",
            self.profile.runtime,
            sh_quote(&container.id),
            sh_quote(&format!("container {} is not running", container.name))
        )
    }

    fn prepare_step(
        &self,
        db: &ContainerDescriptor,
        app: &ContainerDescriptor,
        temp_dir: &str,
        include_other_files: bool,
    ) -> Step {
        let temp = sh_quote(temp_dir);
        let mut subdirs = vec![
            format!("{temp}/{DATABASE_DIR}"),
            format!("{temp}/{MEDIA_DIR}"),
        ];
        if include_other_files {
            subdirs.push(format!("{temp}/{OTHER_FILES_DIR}"));
        }

        Step {
            kind: StepKind::Prepare,
            commands: vec![
                self.running_check(db),
                self.running_check(app),
                create_dir_command(temp_dir),
                format!("mkdir {}", subdirs.join(" ")),
            ],
            artifact: Some(temp_dir.to_string()),
        }
    }

    fn dump_step(&self, db: &ContainerDescriptor, temp_dir: &str) -> Step {
        let dump_file = format!("{temp_dir}/{DATABASE_DIR}/{}.sql", self.profile.db_name);
        Step {
            kind: StepKind::DumpDatabase,
            commands: vec![format!(
                "{} exec {} pg_dump -U {} {} > {}",
                self.profile.runtime,
                sh_quote(&db.id),
                sh_quote(&self.profile.db_user),
                sh_quote(&self.profile.db_name),
                sh_quote(&dump_file)
            )],
            artifact: Some(dump_file),
        }
    }

    fn media_step(&self, data_root: &str, temp_dir: &str) -> Step {
        let source = join(data_root, &self.profile.media_dir);
        let target = format!("{temp_dir}/{MEDIA_DIR}");
        let (src, dst) = (sh_quote(&source), sh_quote(&target));
        Step {
            kind: StepKind::CopyMedia,
            commands: vec![format!(
                "if [ -d {src} ]; then cp -a {src}/. {dst}/; else echo 'no media directory at {}, skipping'; fi",
                source.replace('\'', "")
            )],
            artifact: Some(target),
        }
    }

    fn other_files_step(&self, data_root: &str, temp_dir: &str) -> Step {
        let target = format!("{temp_dir}/{OTHER_FILES_DIR}");
        Step {
            kind: StepKind::CopyOther,
            commands: vec![format!(
                "find {} -mindepth 1 -maxdepth 1 ! -name {} -exec cp -a -t {} {{}} +",
                sh_quote(data_root),
                sh_quote(&self.profile.media_dir),
                sh_quote(&target)
            )],
            artifact: Some(target),
        }
    }
}

fn archive_step(temp_dir: &str, remote_archive: &str, include_other_files: bool) -> Step {
    let mut members = vec![DATABASE_DIR, MEDIA_DIR];
    if include_other_files {
        members.push(OTHER_FILES_DIR);
    }
    Step {
        kind: StepKind::Archive,
        commands: vec![format!(
            "tar -czf {} -C {} {}",
            sh_quote(remote_archive),
            sh_quote(temp_dir),
            members.join(" ")
        )],
        artifact: Some(remote_archive.to_string()),
    }
}

/// Creates the run's temp directory. No `-p`: an existing directory must never be reused.
pub fn create_dir_command(temp_dir: &str) -> String {
    format!("mkdir {}", sh_quote(temp_dir))
}

fn join(root: &str, child: &str) -> String {
    let child = child.trim_matches('/');
    if child.is_empty() {
        root.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), child)
    }
}

fn check_destination(destination: &Path) -> Result<(), PlanValidationError> {
    if !destination.is_dir() {
        return Err(PlanValidationError::DestinationMissing(destination.to_path_buf()));
    }
    tempfile::Builder::new()
        .prefix(".homebox-backup-write-check")
        .tempfile_in(destination)
        .map(drop)
        .map_err(|source| PlanValidationError::DestinationNotWritable {
            path: destination.to_path_buf(),
            source,
        })
}
