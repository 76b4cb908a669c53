use anyhow::{Context, bail};
use chunked_tally::PipelineConfig;
use chunked_tally::TallyService;
use chunked_tally::engine::mock::MockEngine;
use chunked_tally::storage::types::{
    BallotId, ElectionId, ElectionSetup, GuardianId, GuardianRegistration,
};
use clap::Parser;
use rand::Rng;
use rand::seq::SliceRandom;
use std::path::PathBuf;
use std::sync::Arc;

const CANDIDATES: [&str; 3] = ["alice", "bob", "carol"];

/// Runs a synthetic election end to end: chunked tally, guardian decryption, combination.
#[derive(Debug, Parser)]
#[command(name = "chunked-tally", version)]
struct Args {
    /// Number of ballots to cast
    #[arg(long, default_value_t = 250)]
    ballots: usize,

    /// Ballots per chunk (overrides the config file)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Number of guardians
    #[arg(long, default_value_t = 3)]
    guardians: usize,

    /// Guardians required to decrypt
    #[arg(long, default_value_t = 2)]
    threshold: usize,

    /// Guardians that never submit their key share
    #[arg(long, default_value_t = 0)]
    absent: usize,

    /// Pipeline configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a state snapshot here once the run finishes
    #[arg(long)]
    snapshot: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    if args.absent >= args.guardians {
        bail!("at least one guardian must be present");
    }
    if args.guardians - args.absent < args.threshold {
        tracing::warn!(
            "{} present guardian(s) cannot meet threshold {}; results will not be available",
            args.guardians - args.absent,
            args.threshold
        );
    }

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }

    let service = TallyService::new(config, Arc::new(MockEngine::new()))?;
    let election_id = ElectionId(format!("election-{}", uuid::Uuid::new_v4().simple()));

    // 1. Election setup:
    let mut rng = rand::thread_rng();
    let key_shares: Vec<(GuardianId, Vec<u8>)> = (1..=args.guardians)
        .map(|i| {
            let mut share = vec![0u8; 32];
            rng.fill(share.as_mut_slice());
            (GuardianId(format!("guardian-{}", i)), share)
        })
        .collect();

    service.register_election(ElectionSetup {
        election_id: election_id.clone(),
        candidates: CANDIDATES.iter().map(|c| c.to_string()).collect(),
        guardians: key_shares
            .iter()
            .enumerate()
            .map(|(i, (id, share))| GuardianRegistration {
                id: id.clone(),
                sequence_order: i as u32 + 1,
                key_share: share.clone(),
            })
            .collect(),
        threshold: args.threshold,
    })?;

    for i in 0..args.ballots {
        let candidate = CANDIDATES.choose(&mut rng).copied().unwrap_or(CANDIDATES[0]);
        service.add_ballot(
            &election_id,
            BallotId(format!("ballot-{:05}", i)),
            MockEngine::encrypt_vote(candidate),
        )?;
    }
    tracing::info!(
        "Election {} registered with {} ballots and {} guardians",
        election_id,
        args.ballots,
        args.guardians
    );

    // 2. Tally:
    let job_id = service.initiate_tally(&election_id)?;
    let stats = service.run_until_idle().await;
    let tally = service.get_tally_status(&election_id)?;
    tracing::info!(
        "Tally job {}: {:?} ({}/{} chunks, queue {:?})",
        job_id,
        tally.status,
        tally.processed_chunks,
        tally.total_chunks,
        stats
    );

    // 3. Decryption by every present guardian:
    for (guardian_id, share) in key_shares.iter().skip(args.absent) {
        let decision = service
            .initiate_decryption(&election_id, guardian_id, share)
            .with_context(|| format!("initiating decryption for {}", guardian_id))?;
        tracing::info!("Guardian {}: {}", guardian_id, serde_json::to_string(&decision)?);
        service.run_until_idle().await;
    }

    let status = service.get_election_decryption_status(&election_id)?;
    tracing::info!(
        "Decryption {:?}: {}/{} chunks combined",
        status.status,
        status.combined_chunks,
        status.total_chunks
    );

    if let Some(path) = &args.snapshot {
        service.save_snapshot(path).await?;
        tracing::info!("Snapshot written to {}", path.display());
    }

    // 4. Results:
    let result = service.get_aggregated_result(&election_id)?;
    tracing::info!("Final counts: {:?}", result.final_counts);
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
