//! Locally realign reads around indels.
//!
//! Wires the file reader into the realigner stage; the realigner's output
//! passes through its constrained mate-fixing writer before landing here
//! in coordinate order.

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use readforge_lib::header::add_pg_record;
use readforge_lib::intervals::load_intervals;
use readforge_lib::known_sites::load_known_indels;
use readforge_lib::pipeline::{alignment_queue, finish_all, spawn_stage, StageIo, StreamContext};
use readforge_lib::reader::FileReader;
use readforge_lib::realign::{ConsensusModel, LocalRealigner, RealignOptions};
use readforge_lib::reference::ReferenceReader;
use readforge_lib::thread_pool::ThreadPool;
use readforge_lib::validation::validate_file_exists;

use crate::commands::command::Command;
use crate::commands::common::{open_output, write_stream, IoOptions, ThreadsOption};

/// Consensus-model argument.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModelArg {
    /// Only known indel sites.
    KnownsOnly,
    /// Known sites plus indels already present in reads.
    UseReads,
    /// Additionally, Smith-Waterman consensuses.
    UseSw,
}

impl From<ModelArg> for ConsensusModel {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::KnownsOnly => ConsensusModel::KnownsOnly,
            ModelArg::UseReads => ConsensusModel::UseReads,
            ModelArg::UseSw => ConsensusModel::UseSw,
        }
    }
}

/// Locally realign reads around indels.
#[derive(Debug, Parser)]
#[command(
    name = "realign",
    about = "Locally realign reads around indels",
    long_about = "\
Realign reads over a list of target intervals to reduce mismatch entropy
around indels.

Input must be coordinate-sorted. For each interval, overlapping reads are
scored against candidate alternate consensuses (from known indel sites,
from indels in the reads, or from Smith-Waterman alignment, per --model);
when the best candidate clears the log-odds threshold, supporting reads
get new CIGARs and positions, bounded by --max-move. Mate information is
repaired on the way out and the stream stays in coordinate order.

EXAMPLES:

  readforge realign --in sorted.bam --out realigned.bam \\
    --reference ref.fa --intervals targets.intervals \\
    --known indels.vcf --threads 4"
)]
pub struct Realign {
    #[command(flatten)]
    pub io: IoOptions,

    /// Reference genome FASTA.
    #[arg(short = 'R', long = "reference")]
    pub reference: PathBuf,

    /// Target intervals file (`contig:start-stop`, one per line).
    #[arg(short = 'L', long = "intervals")]
    pub intervals: PathBuf,

    /// VCF of known indel sites.
    #[arg(short = 'k', long = "known")]
    pub known: Option<PathBuf>,

    /// Consensus determination model.
    #[arg(long = "model", value_enum, default_value = "use-reads")]
    pub model: ModelArg,

    /// Minimum log-odds improvement to accept an interval's realignment.
    #[arg(long = "lod", default_value_t = 5.0)]
    pub lod: f64,

    /// Column-entropy gate fraction.
    #[arg(long = "entropy", default_value_t = 0.15)]
    pub mismatch_threshold: f64,

    /// Maximum insert size for which pairs may be mate-moved.
    #[arg(long = "max-isize", default_value_t = 3_000)]
    pub max_isize: i32,

    /// Maximum base pairs any read may move.
    #[arg(long = "max-move", default_value_t = 200)]
    pub max_move: u32,

    /// Maximum records buffered by the mate-fixing writer.
    #[arg(long = "max-records-in-memory", default_value_t = 150_000)]
    pub max_records_in_memory: usize,

    /// Maximum reads per interval before it passes through uncleaned.
    #[arg(long = "max-reads", default_value_t = 20_000)]
    pub max_reads_for_realignment: usize,

    /// Maximum candidate consensuses per interval.
    #[arg(long = "max-consensuses", default_value_t = 30)]
    pub max_consensuses: usize,

    /// Maximum reads used to generate consensuses.
    #[arg(long = "max-reads-for-consensuses", default_value_t = 120)]
    pub max_reads_for_consensuses: usize,

    /// Do not write OC/OP original-alignment tags on realigned reads.
    #[arg(long = "no-tags", default_value_t = false)]
    pub no_tags: bool,

    #[command(flatten)]
    pub threads: ThreadsOption,
}

impl Command for Realign {
    fn execute(&self, command_line: &str) -> Result<()> {
        self.io.validate()?;
        validate_file_exists(&self.reference, "Reference FASTA")?;
        validate_file_exists(&self.intervals, "Intervals file")?;
        if let Some(known) = &self.known {
            validate_file_exists(known, "Known-sites VCF")?;
        }
        let threads = self.threads.count()?;

        let reader = FileReader::open(&self.io.inputs, true)?;
        let input_header = reader.header().clone();
        check_coordinate_sorted(&input_header);

        let reference = ReferenceReader::load(&self.reference)?;
        let intervals = load_intervals(&self.intervals, &input_header)?;
        let known_indels = match &self.known {
            Some(path) => load_known_indels(path, &input_header)?,
            None => Vec::new(),
        };
        info!(
            "Loaded {} target interval(s) and {} known indel site(s)",
            intervals.len(),
            known_indels.len()
        );

        let options = RealignOptions {
            consensus_model: self.model.into(),
            lod_threshold: self.lod,
            mismatch_threshold: self.mismatch_threshold,
            max_reads_in_memory: self.max_records_in_memory,
            max_isize_for_movement: self.max_isize,
            max_pos_move_allowed: self.max_move,
            max_consensuses: self.max_consensuses,
            max_reads_for_consensuses: self.max_reads_for_consensuses,
            max_reads_for_realignment: self.max_reads_for_realignment,
            no_original_alignment_tags: self.no_tags,
        };
        let pool = (threads > 1).then(|| Arc::new(ThreadPool::with_workers(threads)));
        let realigner =
            LocalRealigner::new(options, reference, intervals, known_indels, pool);

        let output_header =
            add_pg_record(input_header.clone(), env!("CARGO_PKG_VERSION"), command_line)?;
        let mut writer =
            open_output(&self.io, self.io.inferred_output_format(), &output_header)?;

        let context = StreamContext::new(input_header);
        let (read_tx, read_rx) = alignment_queue(readforge_lib::pipeline::DEFAULT_QUEUE_CAPACITY);
        let (out_tx, out_rx) = alignment_queue(readforge_lib::pipeline::DEFAULT_QUEUE_CAPACITY);

        let reader_handle =
            spawn_stage(reader, StageIo::new(None, vec![read_tx], context.clone()));
        let realigner_handle =
            spawn_stage(realigner, StageIo::new(Some(read_rx), vec![out_tx], context));

        let written = write_stream(&out_rx, &mut writer, &output_header)?;

        let status = finish_all(vec![reader_handle, realigner_handle]);
        if status != 0 {
            bail!("realign pipeline failed with status {status}");
        }

        info!("Wrote {written} records to {}", self.io.out.display());
        Ok(())
    }
}

/// The realigner assumes coordinate order; the header's SO tag is
/// authoritative, so anything else gets a loud warning.
fn check_coordinate_sorted(header: &noodles::sam::Header) {
    use noodles::sam::header::record::value::map::header::tag;

    let sorted = header
        .header()
        .and_then(|hd| hd.other_fields().get(&tag::SORT_ORDER))
        .is_some_and(|so| so.as_slice() == b"coordinate");
    if !sorted {
        warn!("Input header does not declare SO:coordinate; realignment requires coordinate-sorted input");
    }
}
