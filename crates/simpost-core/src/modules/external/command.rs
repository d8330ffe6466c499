use super::{CollapseMode, ExternalOperations, ResampleFactors};
use crate::common::ToolCommands;
use crate::domain::{HeaderAttribute, PipelineError, PipelineResult};
use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Output};
use tracing::debug;

/// Runs the imaging tool binaries named in [`ToolCommands`].
#[derive(Debug, Clone)]
pub struct CommandOperations {
    commands: ToolCommands,
}

impl CommandOperations {
    pub fn new(commands: ToolCommands) -> Self {
        Self { commands }
    }

    fn run(&self, program: &str, args: Vec<OsString>) -> PipelineResult<Output> {
        debug!(
            program,
            args = ?args,
            "running external operation"
        );
        let output = Command::new(program).args(&args).output().map_err(|source| {
            PipelineError::external(
                "EXT.SPAWN",
                format!("failed to execute '{}': {}", program, source),
            )
        })?;

        if output.status.success() {
            return Ok(output);
        }

        let status_text = output.status.code().map_or_else(
            || "terminated by signal".to_string(),
            |code| format!("exit code {}", code),
        );
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(PipelineError::external(
            "EXT.NONZERO_EXIT",
            format!(
                "'{}' failed with {}: {}",
                program,
                status_text,
                stderr.trim()
            ),
        ))
    }
}

fn arg(value: impl Into<OsString>) -> OsString {
    value.into()
}

fn path_arg(path: &Path) -> OsString {
    path.as_os_str().to_os_string()
}

impl ExternalOperations for CommandOperations {
    fn backend_name(&self) -> &'static str {
        "command"
    }

    fn copy_header(&self, source: &Path, target: &Path) -> PipelineResult<()> {
        self.run(
            &self.commands.copy_header,
            vec![path_arg(source), path_arg(target)],
        )
        .map(|_| ())
    }

    fn set_header_attributes(
        &self,
        target: &Path,
        attributes: &[HeaderAttribute],
    ) -> PipelineResult<()> {
        let mut args = Vec::with_capacity(attributes.len() * 3 + 1);
        for attribute in attributes {
            args.push(arg("-i"));
            args.push(arg(attribute.name.as_str()));
            args.push(arg(attribute.value.as_str()));
        }
        args.push(path_arg(target));
        self.run(&self.commands.set_header, args).map(|_| ())
    }

    fn read_header_attribute(&self, file: &Path, name: &str) -> PipelineResult<Option<String>> {
        let output = self.run(
            &self.commands.read_header,
            vec![arg("-i"), arg(name), path_arg(file)],
        )?;
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!value.is_empty()).then_some(value))
    }

    fn resample(
        &self,
        factors: ResampleFactors,
        mode: CollapseMode,
        input: &Path,
        output: &Path,
    ) -> PipelineResult<()> {
        let mut args = Vec::new();
        if mode == CollapseMode::Average {
            args.push(arg("-a"));
        }
        args.push(arg(factors.x.to_string()));
        args.push(arg(factors.y.to_string()));
        let program = match factors.z {
            Some(z) => {
                args.push(arg(z.to_string()));
                &self.commands.collapse3d
            }
            None => &self.commands.collapse,
        };
        args.push(path_arg(input));
        args.push(path_arg(output));
        self.run(program, args).map(|_| ())
    }

    fn add_noise(&self, input: &Path, output: &Path) -> PipelineResult<()> {
        self.run(
            &self.commands.add_noise,
            vec![arg("-i"), path_arg(input), path_arg(output)],
        )
        .map(|_| ())
    }

    fn hu_to_attenuation(
        &self,
        kev: f64,
        pixel_size_cm: f64,
        input: &Path,
        output: &Path,
    ) -> PipelineResult<()> {
        self.run(
            &self.commands.hu_to_attenuation,
            vec![
                arg("-e"),
                arg(kev.to_string()),
                arg("-s"),
                arg(pixel_size_cm.to_string()),
                path_arg(input),
                path_arg(output),
            ],
        )
        .map(|_| ())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::CommandOperations;
    use crate::common::ToolCommands;
    use crate::domain::{ErrorCategory, HeaderAttribute};
    use crate::modules::external::{CollapseMode, ExternalOperations, ResampleFactors};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Writes a shell script that appends its arguments to `calls.txt`.
    fn recording_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(
            &path,
            format!(
                "#!/bin/sh\necho \"{} $*\" >> \"{}\"\n{}\n",
                name,
                dir.join("calls.txt").display(),
                body
            ),
        )
        .expect("script should be written");
        let mut permissions = fs::metadata(&path).expect("metadata").permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions).expect("permissions");
        path
    }

    fn commands(dir: &Path) -> ToolCommands {
        let tool = |name: &str, body: &str| {
            recording_tool(dir, name, body).display().to_string()
        };
        ToolCommands {
            copy_header: tool("imgcpinfo", ""),
            set_header: tool("imsetinfo", ""),
            read_header: tool("imghdr", "echo '4.42 4.42'"),
            collapse: tool("collapse", ""),
            collapse3d: tool("collapse3d", ""),
            add_noise: tool("addnoise", "exit 3"),
            hu_to_attenuation: tool("hu2atn", ""),
        }
    }

    fn calls(dir: &Path) -> String {
        fs::read_to_string(dir.join("calls.txt")).expect("calls should be recorded")
    }

    #[test]
    fn collapse_arguments_follow_tool_conventions() {
        let temp = TempDir::new().expect("tempdir should be created");
        let operations = CommandOperations::new(commands(temp.path()));

        operations
            .resample(
                ResampleFactors {
                    x: 2.0,
                    y: 2.0,
                    z: None,
                },
                CollapseMode::Sum,
                Path::new("in.im"),
                Path::new("out.im"),
            )
            .expect("collapse");
        operations
            .resample(
                ResampleFactors {
                    x: 2.0,
                    y: 2.0,
                    z: Some(1.5),
                },
                CollapseMode::Average,
                Path::new("ct.im"),
                Path::new("ct_128.im"),
            )
            .expect("collapse3d");

        let recorded = calls(temp.path());
        assert!(recorded.contains("collapse 2 2 in.im out.im"));
        assert!(recorded.contains("collapse3d -a 2 2 1.5 ct.im ct_128.im"));
    }

    #[test]
    fn header_attributes_are_passed_as_flag_triples() {
        let temp = TempDir::new().expect("tempdir should be created");
        let operations = CommandOperations::new(commands(temp.path()));

        operations
            .set_header_attributes(
                Path::new("atn.w1.im"),
                &[
                    HeaderAttribute::new("Modality", "CT"),
                    HeaderAttribute::new("Slices Spacing", "-4.8"),
                ],
            )
            .expect("set header");
        let value = operations
            .read_header_attribute(Path::new("x.im"), "Pixel Size")
            .expect("read header");

        assert_eq!(value.as_deref(), Some("4.42 4.42"));
        let recorded = calls(temp.path());
        assert!(recorded.contains("imsetinfo -i Modality CT -i Slices Spacing -4.8 atn.w1.im"));
        assert!(recorded.contains("imghdr -i Pixel Size x.im"));
    }

    #[test]
    fn non_zero_exit_is_an_external_operation_error() {
        let temp = TempDir::new().expect("tempdir should be created");
        let operations = CommandOperations::new(commands(temp.path()));

        let error = operations
            .add_noise(Path::new("prj.nf.avg.w01.im"), Path::new("prj.n.avg.w01.im"))
            .expect_err("addnoise exits 3");
        assert_eq!(error.category(), ErrorCategory::ExternalOperation);
        assert_eq!(error.code(), "EXT.NONZERO_EXIT");
        assert!(error.message().contains("exit code 3"));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let operations = CommandOperations::new(ToolCommands {
            add_noise: "/nonexistent/simpost-addnoise".to_string(),
            ..ToolCommands::default()
        });
        let error = operations
            .add_noise(Path::new("a.im"), Path::new("b.im"))
            .expect_err("binary is missing");
        assert_eq!(error.code(), "EXT.SPAWN");
    }
}
