use crate::build_context::{self, Arch, ContextInputs};
use crate::config::SessionConfig;
use crate::docker::{args, Docker, DockerRunner};
use crate::error::BoxError;
use crate::lifecycle;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRequest {
    Ensure,
    Build,
    ForcePull,
    ForceRebuild,
}

impl ImageRequest {
    pub fn from_flags(build: bool, force_pull: bool, force_rebuild: bool) -> Self {
        if force_rebuild {
            Self::ForceRebuild
        } else if build {
            Self::Build
        } else if force_pull {
            Self::ForcePull
        } else {
            Self::Ensure
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageState {
    Present,
    Pulled,
    Built,
}

pub struct ImageResolver<'d, 'a, R: DockerRunner> {
    docker: &'d Docker<'a, R>,
    session: &'d SessionConfig,
    bundle_binary: bool,
}

impl<'d, 'a, R: DockerRunner> ImageResolver<'d, 'a, R> {
    pub fn new(docker: &'d Docker<'a, R>, session: &'d SessionConfig) -> Self {
        Self {
            docker,
            session,
            bundle_binary: false,
        }
    }

    /// Copy the running binary into built images when it can run there.
    pub fn bundle_binary(mut self, bundle: bool) -> Self {
        self.bundle_binary = bundle;
        self
    }

    pub fn resolve(&self, request: ImageRequest) -> Result<ImageState, BoxError> {
        match request {
            ImageRequest::Ensure => {
                if self.image_present()? {
                    tracing::debug!(image = %self.session.image, "image present");
                    Ok(ImageState::Present)
                } else {
                    self.pull_or_build()
                }
            }
            ImageRequest::Build => self.build(),
            ImageRequest::ForcePull => self.pull_or_build(),
            ImageRequest::ForceRebuild => {
                self.purge()?;
                self.build()
            }
        }
    }

    pub fn image_present(&self) -> Result<bool, BoxError> {
        let output = self
            .docker
            .query(&args(["image", "inspect", self.session.image.as_str()]))?;
        Ok(output.success())
    }

    fn pull_or_build(&self) -> Result<ImageState, BoxError> {
        match self.pull() {
            Ok(()) => Ok(ImageState::Pulled),
            Err(err) => {
                tracing::warn!(remote = %self.session.remote_image, %err, "pull failed, building locally");
                self.build()
            }
        }
    }

    fn pull(&self) -> Result<(), BoxError> {
        let remote = self.session.remote_image.as_str();
        let image = self.session.image.as_str();
        self.docker.stream(&args(["pull", remote]))?;
        if remote != image {
            self.docker.mutate(&args(["tag", remote, image]))?;
        }
        tracing::info!(remote, image, "pulled image");
        Ok(())
    }

    fn purge(&self) -> Result<(), BoxError> {
        let removed = lifecycle::remove_stopped(self.docker)?;
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "removed stopped managed containers");
        }
        if let Err(err) = self
            .docker
            .mutate(&args(["rmi", self.session.image.as_str()]))
        {
            tracing::debug!(image = %self.session.image, %err, "image removal failed");
        }
        Ok(())
    }

    pub fn build(&self) -> Result<ImageState, BoxError> {
        let arch = Arch::detect(self.docker);
        let context_dir = tempfile::Builder::new().prefix("agentbox-build-").tempdir()?;
        let identity = &self.session.identity;
        let bundled_binary = if self.bundle_binary {
            build_context::bundleable_binary(arch)
        } else {
            None
        };
        build_context::write_build_context(
            context_dir.path(),
            &ContextInputs {
                arch,
                packages: &self.session.packages,
                identity,
                config_dir: &self.session.config_dir,
                marketplace: &self.session.marketplace,
                bundled_binary,
            },
        )?;

        let ctx = context_dir.path().display().to_string();
        let dockerfile = context_dir.path().join("Dockerfile").display().to_string();
        let build = args([
            "build".to_string(),
            "-t".to_string(),
            self.session.image.clone(),
            "--build-arg".to_string(),
            format!("USERNAME={}", identity.username),
            "--build-arg".to_string(),
            format!("USER_UID={}", identity.uid),
            "--build-arg".to_string(),
            format!("USER_GID={}", identity.gid),
            "-f".to_string(),
            dockerfile,
            ctx,
        ]);
        self.docker
            .stream(&build)
            .map_err(|err| BoxError::Resolution(format!("building {} failed: {err}", self.session.image)))?;
        tracing::info!(image = %self.session.image, "built image");
        Ok(ImageState::Built)
    }

    pub fn push(&self, repository: &str) -> Result<(), BoxError> {
        self.docker
            .mutate(&args(["tag", self.session.image.as_str(), repository]))?;
        self.docker.stream(&args(["push", repository]))?;
        tracing::info!(repository, "pushed image");
        Ok(())
    }
}
