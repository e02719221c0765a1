use crate::artifacts::{ArtifactAddress, ArtifactKind, ArtifactStore};
use crate::errors::ArtifactError;
use crate::router::ArtifactUpload;
use fedrun_common::Run;

/// Gather the round's `logs.txt` and `mid-artifacts.txt` for forwarding.
/// Missing files are left out; the result may be empty.
pub fn collect(artifacts: &ArtifactStore, run: &Run) -> Result<ArtifactUpload, ArtifactError> {
    let address = ArtifactAddress::for_run(run);
    let logs = artifacts.read(&address, ArtifactKind::Logs)?;
    let mid_artifacts = artifacts.read(&address, ArtifactKind::MidArtifacts)?;

    Ok(ArtifactUpload {
        run_id: address.run_id,
        task_seq: address.task_seq,
        round_seq: address.round_seq,
        logs,
        mid_artifacts,
    })
}

/// [`collect`] on the blocking pool, so file reads never stall the runtime
/// threads that drive the other partitions.
pub async fn gather(artifacts: ArtifactStore, run: Run) -> Result<ArtifactUpload, ArtifactError> {
    tokio::task::spawn_blocking(move || collect(&artifacts, &run))
        .await
        .map_err(|err| ArtifactError::Interrupted(err.to_string()))?
}
