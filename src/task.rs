//! Batch rewriting of module files.
//!
//! [`RewriteTask`] is the build-step entry point: it reads each target container, runs the
//! rewrite pass and writes the result in place or into an output directory. Processing
//! stops at the first failing target; targets before it stay rewritten.
//!
//! ```rust,no_run
//! use dotshim::task::{RewriteTarget, RewriteTask};
//!
//! let task = RewriteTask::new(vec![RewriteTarget::in_place("bin/Demo.dshm")]);
//! for (target, report) in task.execute()? {
//!     println!("{}: {} call sites", target.display(), report.sites);
//! }
//! # Ok::<(), dotshim::Error>(())
//! ```

use std::path::{Path, PathBuf};

use log::{error, info};

use crate::{
    rewriter::{rewrite_module, CallSiteRewriter, RewriteOptions, RewriteReport},
    Module, Result,
};

/// One file to rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteTarget {
    /// The container to read
    pub input: PathBuf,
    /// Where to write the result, `None` to overwrite the input
    pub output: Option<PathBuf>,
}

impl RewriteTarget {
    /// Rewrite `input` in place.
    pub fn in_place(input: impl Into<PathBuf>) -> Self {
        RewriteTarget {
            input: input.into(),
            output: None,
        }
    }

    /// Rewrite `input` into `output`.
    pub fn to(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        RewriteTarget {
            input: input.into(),
            output: Some(output.into()),
        }
    }
}

/// Rewrite a single container.
///
/// The input is fully parsed before anything is written, so `output` may equal `input`.
///
/// # Errors
/// Returns the read, rewrite or write error of the file.
pub fn rewrite_file(input: &Path, output: &Path, options: &RewriteOptions) -> Result<RewriteReport> {
    info!("Reading module '{}'", input.display());
    let mut module = Module::from_file(input)?;

    let mut rewriter = CallSiteRewriter::new(options.clone());
    let report = rewrite_module(&mut module, &mut rewriter, options)?;

    info!("Writing module '{}'", output.display());
    module.write_to_file(output)?;
    Ok(report)
}

/// Rewrites a list of files.
#[derive(Debug, Clone, Default)]
pub struct RewriteTask {
    targets: Vec<RewriteTarget>,
    output_dir: Option<PathBuf>,
    options: RewriteOptions,
}

impl RewriteTask {
    /// A task over `targets` with default options.
    #[must_use]
    pub fn new(targets: Vec<RewriteTarget>) -> Self {
        RewriteTask {
            targets,
            ..RewriteTask::default()
        }
    }

    /// Write targets without an explicit output into `dir`, keeping their file names.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Replace the rewrite options.
    #[must_use]
    pub fn with_options(mut self, options: RewriteOptions) -> Self {
        self.options = options;
        self
    }

    fn output_for(&self, target: &RewriteTarget) -> PathBuf {
        if let Some(output) = &target.output {
            return output.clone();
        }
        match (&self.output_dir, target.input.file_name()) {
            (Some(dir), Some(name)) => dir.join(name),
            _ => target.input.clone(),
        }
    }

    /// Rewrite every target in order and return the written paths with their reports.
    ///
    /// # Errors
    /// Returns the error of the first target that fails; later targets are not touched.
    pub fn execute(&self) -> Result<Vec<(PathBuf, RewriteReport)>> {
        let mut done = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let output = self.output_for(target);
            match rewrite_file(&target.input, &output, &self.options) {
                Ok(report) => done.push((output, report)),
                Err(err) => {
                    error!(
                        "Unknown error while trying to rewrite module '{}': {}",
                        target.input.display(),
                        err
                    );
                    return Err(err);
                }
            }
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_paths() {
        let task = RewriteTask::new(vec![]).with_output_dir("out");
        assert_eq!(
            task.output_for(&RewriteTarget::in_place("bin/Demo.dshm")),
            Path::new("out").join("Demo.dshm")
        );
        assert_eq!(
            task.output_for(&RewriteTarget::to("bin/Demo.dshm", "x/Other.dshm")),
            PathBuf::from("x/Other.dshm")
        );
        assert_eq!(
            RewriteTask::new(vec![]).output_for(&RewriteTarget::in_place("bin/Demo.dshm")),
            PathBuf::from("bin/Demo.dshm")
        );
    }
}
