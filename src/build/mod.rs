//! Recipe execution.
//!
//! Stages are built in declaration order, each backed by a container
//! created from its base image. Multi-platform builds repeat the pipeline
//! per platform, writing each result to a platform-specific output
//! directory. All stage containers are destroyed when the build completes,
//! on every exit path, including cancellation.

mod copy;
mod state;
mod step;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::container::Container;
use crate::error::{Error, Result};
use crate::platform::OciPlatform;
use crate::recipe::{Recipe, Stage};
use crate::runtime::Runtime;

/// Controls recipe execution.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Recipe to execute.
    pub recipe: Recipe,
    /// Resource name, used as a prefix for container ids.
    pub resource: String,
    /// Directory for the exported image.
    pub output: PathBuf,
    /// Project root, for resolving copy sources.
    pub root: PathBuf,
    /// OCI entrypoint for the output image (services only).
    pub entrypoint: Vec<String>,
    /// Target platforms (e.g. `["linux/amd64"]`). Defaults to the host.
    pub platforms: Vec<String>,
}

/// Returned after successful recipe execution.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// Directory containing the exported image.
    pub output: PathBuf,
}

/// Executes a recipe against the container runtime.
///
/// The `cancel` future aborts the build when it resolves; registered
/// containers are destroyed regardless of outcome, detached from the
/// cancellation.
pub async fn run(
    rt: &Runtime,
    opts: Options,
    cancel: impl Future<Output = ()>,
) -> Result<BuildOutput> {
    let platforms = if opts.platforms.is_empty() {
        vec![OciPlatform::host()]
    } else {
        opts.platforms
            .iter()
            .map(|p| OciPlatform::parse(p))
            .collect::<Result<Vec<_>>>()?
    };

    info!(
        "executing recipe: resource={} output={} stages={} platforms={:?}",
        opts.resource,
        opts.output.display(),
        opts.recipe.stages.len(),
        platforms.iter().map(ToString::to_string).collect::<Vec<_>>(),
    );

    create_output_dir(&opts.output)?;

    let mut build = Build {
        rt,
        resource: opts.resource,
        output: opts.output,
        context: opts.root,
        entrypoint: opts.entrypoint,
        platforms,
        containers: Vec::new(),
    };

    let result = {
        let run = build.build_platforms(&opts.recipe.stages);
        tokio::pin!(run);
        tokio::pin!(cancel);
        tokio::select! {
            res = &mut run => res,
            () = &mut cancel => Err(Error::Cancelled),
        }
    };

    build.destroy_containers().await;

    result?;
    Ok(BuildOutput { output: build.output })
}

/// Shared state for building all stages of a recipe.
struct Build<'a> {
    rt: &'a Runtime,
    resource: String,
    output: PathBuf,
    context: PathBuf,
    entrypoint: Vec<String>,
    platforms: Vec<OciPlatform>,
    /// All stage containers across all platforms, destroyed after the build.
    containers: Vec<Container>,
}

impl Build<'_> {
    /// Builds the recipe for every target platform in turn.
    async fn build_platforms(&mut self, stages: &[Stage]) -> Result<()> {
        for platform in self.platforms.clone() {
            self.build_platform(stages, &platform).await?;
        }
        Ok(())
    }

    /// Builds all stages of the recipe for a single platform.
    ///
    /// Each platform keeps its own map of named stage containers for
    /// cross-stage copy lookups.
    async fn build_platform(&mut self, stages: &[Stage], platform: &OciPlatform) -> Result<()> {
        info!("building platform {}", platform);

        let output = self.platform_output(platform);
        create_output_dir(&output)?;

        let mut stage_map: HashMap<String, Container> = HashMap::new();

        for (i, stage) in stages.iter().enumerate() {
            if let Err(err) = self
                .build_stage(stage, i, platform, &output, &mut stage_map)
                .await
            {
                return Err(Error::Stage {
                    platform: platform.to_string(),
                    stage: stage_label(&stage.name, i),
                    source: Box::new(err),
                });
            }
        }

        Ok(())
    }

    /// Builds a single stage: start a container from the base image, run
    /// the steps, and export non-transient stages to the output directory.
    async fn build_stage(
        &mut self,
        stage: &Stage,
        index: usize,
        platform: &OciPlatform,
        output: &Path,
        stage_map: &mut HashMap<String, Container>,
    ) -> Result<()> {
        info!("building stage {} for {}", stage_label(&stage.name, index), platform);

        let source = stage.base_image()?;
        let id = self.container_id(&stage.name, index, platform);
        let ctr = self.rt.start_container(&source, &id, platform).await?;

        self.containers.push(ctr.clone());
        if !stage.name.is_empty() {
            stage_map.insert(stage.name.clone(), ctr.clone());
        }

        let mut state = state::StepState::new();
        step::execute_steps(&ctr, &stage.steps, &mut state, &self.context, stage_map).await?;

        if !stage.transient {
            ctr.stop().await?;
            ctr.export(output, &self.entrypoint).await?;
        }

        Ok(())
    }

    /// Destroys all stage containers.
    async fn destroy_containers(&mut self) {
        for ctr in self.containers.drain(..) {
            ctr.destroy().await;
        }
    }

    /// Returns a unique container id for a stage, scoped to this resource
    /// and platform.
    fn container_id(&self, name: &str, index: usize, platform: &OciPlatform) -> String {
        let slug = platform.slug();
        if name.is_empty() {
            format!("{}-{}-stage-{}", self.resource, slug, index + 1)
        } else {
            format!("{}-{}-stage-{}", self.resource, slug, name)
        }
    }

    /// Returns the output directory for a specific platform.
    ///
    /// A single-platform build keeps the output directory as-is, preserving
    /// the `<output>/image.tar` convention. Multi-platform builds write to
    /// one subdirectory per platform (e.g. `<output>/linux-amd64`).
    fn platform_output(&self, platform: &OciPlatform) -> PathBuf {
        if self.platforms.len() == 1 {
            self.output.clone()
        } else {
            self.output.join(platform.slug())
        }
    }
}

/// Label for a stage: the quoted name when set, the 1-based index otherwise.
fn stage_label(name: &str, index: usize) -> String {
    if name.is_empty() {
        format!("{}", index + 1)
    } else {
        format!("{name:?}")
    }
}

/// Creates a directory tree with mode 0755.
fn create_output_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| Error::FileSystem(e.to_string()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| Error::FileSystem(e.to_string()))?;
    }
    Ok(())
}
