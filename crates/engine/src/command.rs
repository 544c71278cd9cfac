use jobmill_store::ClaimedJob;

/// Build the argv for one job run.
///
/// The configured command is tokenized on whitespace; a bare `.sh` script is
/// wrapped with `bash`. User column values are appended in table declaration
/// order, either positionally or as `--column value` pairs; NULL values are
/// skipped.
pub(crate) fn build_argv(command: &str, named_args: bool, job: &ClaimedJob) -> Vec<String> {
    let mut argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    if argv.len() == 1 && argv[0].ends_with(".sh") && !argv[0].starts_with("bash") {
        argv.insert(0, "bash".to_string());
    }

    for arg in &job.args {
        let Some(value) = &arg.value else { continue };
        if named_args {
            argv.push(format!("--{}", arg.column));
        }
        argv.push(value.clone());
    }

    argv
}
