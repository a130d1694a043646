use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::models::{HpcContext, OutputArtifact};

const JOB_ID_VARS: &[&str] = &["SLURM_JOB_ID", "SLURM_JOBID"];
const PARTITION_VARS: &[&str] = &["SLURM_JOB_PARTITION"];
const NODE_LIST_VARS: &[&str] = &["SLURM_JOB_NODELIST", "SLURM_NODELIST"];
const GPU_VARS: &[&str] = &["SLURM_JOB_GPUS", "SLURM_STEP_GPUS", "CUDA_VISIBLE_DEVICES"];

/// SHA-256 of a file's contents, as `sha256:<hex>`.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

pub fn checksum_artifact(path: &Path) -> std::io::Result<OutputArtifact> {
    let metadata = std::fs::metadata(path)?;
    if !metadata.is_file() {
        return Err(std::io::Error::other(format!(
            "'{}' is not a regular file",
            path.display()
        )));
    }
    Ok(OutputArtifact {
        path: path.to_string_lossy().to_string(),
        checksum: sha256_file(path)?,
    })
}

/// Scheduler context of the current process, `None` outside a batch job.
pub fn capture_hpc_context() -> Option<HpcContext> {
    hpc_context_from(|key| std::env::var(key).ok())
}

pub fn hpc_context_from(lookup: impl Fn(&str) -> Option<String>) -> Option<HpcContext> {
    let first = |keys: &[&str]| {
        keys.iter()
            .filter_map(|key| lookup(key))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
    };

    let context = HpcContext {
        job_id: first(JOB_ID_VARS),
        partition: first(PARTITION_VARS),
        node_list: first(NODE_LIST_VARS),
        gpus: first(GPU_VARS),
    };

    if context.is_empty() { None } else { Some(context) }
}

pub fn hostname() -> String {
    let mut buffer = [0u8; 256];
    let result = unsafe { libc::gethostname(buffer.as_mut_ptr().cast(), buffer.len()) };
    if result != 0 {
        return std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    }
    let end = buffer.iter().position(|byte| *byte == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).to_string()
}

/// Whether `pid` names a live process on this host.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}
