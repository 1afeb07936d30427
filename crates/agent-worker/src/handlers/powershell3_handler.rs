// PowerShell3Handler mapping `PowerShell3Handler.cs`.
// Imports the task's bundled VstsTaskSdk module and runs the target script
// inside `Invoke-VstsTaskScript`.

use agent_common::HandlerError;
use agent_sdk::{ArgUtil, ProcessExitCodeError, ProcessOptions, WhichUtil};
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::execution_context::ExecutionContext;
use crate::handlers::handler::{Handler, HandlerBase, HandlerOutcome};
use crate::handlers::handler_data::PowerShell3HandlerData;
use crate::handlers::step_host::StepHost;

/// The PowerShell executable as the step host sees it. Falls back to the bare
/// name when it is not on the agent's `PATH`, which is what a container needs.
pub fn resolve_powershell_exe(step_host: &dyn StepHost) -> Result<String> {
    let name = if cfg!(windows) { "powershell" } else { "pwsh" };
    let path = WhichUtil::which(name, false)?
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    Ok(step_host.resolve_path_for_step_host(&path))
}

/// Arguments for `powershell.exe`. `module` is nested in one level of single
/// quotes, `script` in two.
pub fn powershell3_arguments(module: &str, script: &str, debug: bool) -> String {
    let preference = if debug { "Continue" } else { "SilentlyContinue" };
    format!(
        "-NoLogo -Sta -NoProfile -NonInteractive -ExecutionPolicy Unrestricted -Command \". \
([scriptblock]::Create('if ([Console]::InputEncoding -is [Text.UTF8Encoding] -and [Console]::InputEncoding.GetPreamble().Length -ne 0) {{ [Console]::InputEncoding = New-Object Text.UTF8Encoding $false }}')) 2>&1 \
| ForEach-Object {{ Write-Verbose $_.Exception.Message -Verbose }} ; \
Import-Module -Name '{module}' -ArgumentList @{{ NonInteractive = $true }} -ErrorAction Stop ; \
$VerbosePreference = '{preference}' ; $DebugPreference = '{preference}' ; \
Invoke-VstsTaskScript -ScriptBlock ([scriptblock]::Create('. ''{script}'''))\"",
        module = module.replace('\'', "''"),
        script = script.replace('\'', "''''"),
    )
}

pub struct PowerShell3Handler {
    base: HandlerBase,
    data: PowerShell3HandlerData,
}

impl PowerShell3Handler {
    pub fn new(base: HandlerBase, data: PowerShell3HandlerData) -> Self {
        Self { base, data }
    }
}

#[async_trait]
impl Handler for PowerShell3Handler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn run_async(&mut self, context: &mut ExecutionContext) -> Result<HandlerOutcome> {
        let variables = context.variables();

        self.base.add_inputs_to_environment();
        self.base.add_endpoints_to_environment(context)?;
        self.base.add_secure_files_to_environment(context);
        self.base.add_variables_to_environment(context, false, false)?;

        let target = variables.expand_values(&self.data.target);
        ArgUtil::not_null_or_empty(&target, "Target").map_err(HandlerError::from)?;
        let script_file = self.base.resolve_task_path(&target);
        ArgUtil::file_exists(&script_file, "Target").map_err(HandlerError::from)?;

        let script_directory = script_file.parent().unwrap_or(Path::new("")).to_path_buf();
        let module_file = script_directory
            .join("ps_modules")
            .join("VstsTaskSdk")
            .join("VstsTaskSdk.psd1");
        ArgUtil::file_exists(&module_file, "VstsTaskSdk").map_err(HandlerError::from)?;

        let step_host = Arc::clone(&self.base.step_host);
        let arguments = powershell3_arguments(
            &step_host.resolve_path_for_step_host(&module_file.to_string_lossy()),
            &step_host.resolve_path_for_step_host(&script_file.to_string_lossy()),
            variables.system_debug(),
        );
        let powershell = resolve_powershell_exe(step_host.as_ref())?;
        context.command(&format!("{powershell} {arguments}"));

        let options = ProcessOptions {
            require_exit_code_zero: true,
            kill_process_on_cancel: false,
            inherit_console_handler: !variables.retain_default_encoding(),
            ..Default::default()
        };
        let working_directory =
            step_host.resolve_path_for_step_host(&script_directory.to_string_lossy());
        let request =
            self.base
                .exec_request(context, &working_directory, &powershell, &arguments, options);

        self.base
            .execute(context, &request, None)
            .await
            .map_err(|e| match e.downcast_ref::<ProcessExitCodeError>() {
                Some(exit) => HandlerError::task(format!(
                    "Process completed with exit code {}.",
                    exit.exit_code
                ))
                .into(),
                None => e,
            })?;
        Ok(HandlerOutcome::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_context::make_test_context;
    use crate::handlers::step_host::RecordingStepHost;
    use std::collections::{BTreeMap, HashMap};

    fn task_dir(root: &Path) -> std::path::PathBuf {
        let dir = root.join("tasks").join("ps3");
        let sdk = dir.join("ps_modules").join("VstsTaskSdk");
        std::fs::create_dir_all(&sdk).unwrap();
        std::fs::write(sdk.join("VstsTaskSdk.psd1"), "@{}").unwrap();
        std::fs::write(dir.join("run's.ps1"), "exit 1").unwrap();
        dir
    }

    fn handler(ctx: &ExecutionContext, host: Arc<dyn StepHost>, dir: &Path) -> PowerShell3Handler {
        let base = HandlerBase::new(
            Arc::clone(ctx.host_context()),
            "PowerShell3Handler",
            host,
            BTreeMap::new(),
            HashMap::new(),
            dir.to_path_buf(),
        );
        PowerShell3Handler::new(
            base,
            PowerShell3HandlerData {
                target: "run's.ps1".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn quotes_are_doubled_per_nesting_level() {
        let args = powershell3_arguments("/m/o'k.psd1", "/s/it's.ps1", false);
        assert!(args.contains("Import-Module -Name '/m/o''k.psd1'"));
        assert!(args.contains("[scriptblock]::Create('. ''/s/it''''s.ps1''')"));
        assert!(args.contains("$VerbosePreference = 'SilentlyContinue'"));
        assert!(powershell3_arguments("m", "s", true).contains("$DebugPreference = 'Continue'"));
    }

    #[tokio::test]
    async fn runs_in_the_script_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let dir = task_dir(root.path());
        let host = Arc::new(RecordingStepHost::new(0));
        let mut h = handler(&ctx, host.clone(), &dir);

        h.run_async(&mut ctx).await.unwrap();

        let request = host.last_request();
        assert_eq!(request.working_directory, dir.to_string_lossy());
        assert!(request.arguments.contains("Invoke-VstsTaskScript"));
        assert!(request.options.require_exit_code_zero);
        assert!(!request.options.kill_process_on_cancel);
        assert!(ctx
            .log_lines()
            .contains(&format!("##[command]{} {}", request.file_name, request.arguments)));
    }

    #[tokio::test]
    async fn script_exit_one_fails_the_task() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let dir = task_dir(root.path());
        let mut h = handler(&ctx, Arc::new(RecordingStepHost::new(1)), &dir);

        let err = h.run_async(&mut ctx).await.unwrap_err();
        assert!(matches!(HandlerError::classify(&err), Some(HandlerError::Task(_))));
        assert_eq!(err.to_string(), "Process completed with exit code 1.");
    }

    #[tokio::test]
    async fn missing_sdk_module_is_a_validation_error() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let dir = task_dir(root.path());
        std::fs::remove_dir_all(dir.join("ps_modules")).unwrap();
        let mut h = handler(&ctx, Arc::new(RecordingStepHost::new(0)), &dir);

        let err = h.run_async(&mut ctx).await.unwrap_err();
        assert!(matches!(
            HandlerError::classify(&err),
            Some(HandlerError::Validation(_))
        ));
    }
}
