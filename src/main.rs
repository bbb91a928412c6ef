//! bucketize – route a sparse feature batch to its owning partitions
//!  * input  – TSV, one (feature,row) bag per line, feature-major:
//!             `idx,idx,...[<TAB>w,w,...]`  (blank line = empty bag, `#` = comment)
//!  * output – TSV, one line per non-empty (partition,row) cell
//!  * --permute-output – one slot per input element (needs --sequence)
use std::time::Instant;
use log::info;
use anyhow::{bail, ensure, Context, Result};
use clap::{Arg, ArgAction, Command, value_parser};
use rayon::prelude::*;
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    str::FromStr,
};
use sparse_bucketize::{BoundaryTable, BucketizeParams, BucketizedBatch, SparseBatch, bucketize};

/// Parsed input batch.
#[derive(Debug, Default, PartialEq)]
struct Batch {
    lengths: Vec<i64>,
    indices: Vec<i64>,
    weights: Option<Vec<f32>>,
}

fn parse_list<T>(s: &str) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<T>().with_context(|| format!("bad list entry '{t}'")))
        .collect()
}

fn read_batch(p: &str) -> Result<Batch> {
    let f = File::open(p).with_context(|| format!("open batch file {p}"))?;
    let mut batch = Batch::default();
    let mut weights = Vec::new();
    let mut weighted: Option<bool> = None;

    for (lineno, line) in BufReader::new(f).lines().enumerate() {
        let line = line?;
        if line.starts_with('#') {
            continue;
        }
        let mut cols = line.split('\t');
        let idx: Vec<i64> = parse_list(cols.next().unwrap_or(""))
            .with_context(|| format!("{p}:{}: indices", lineno + 1))?;
        let w = cols.next();

        // a bag is weighted iff it has a second column; empty bags may omit it
        if !idx.is_empty() {
            let has_w = w.is_some();
            match weighted {
                None => weighted = Some(has_w),
                Some(prev) if prev != has_w => {
                    bail!("{p}:{}: weights present on some bags only", lineno + 1)
                }
                _ => {}
            }
        }
        if let Some(w) = w {
            let w: Vec<f32> = parse_list(w).with_context(|| format!("{p}:{}: weights", lineno + 1))?;
            ensure!(
                w.len() == idx.len(),
                "{p}:{}: {} indices but {} weights",
                lineno + 1,
                idx.len(),
                w.len()
            );
            weights.extend(w);
        }
        batch.lengths.push(idx.len() as i64);
        batch.indices.extend(idx);
    }
    if weighted == Some(true) {
        batch.weights = Some(weights);
    }
    Ok(batch)
}

/// One comma-separated cut list per feature; a blank line keeps the block policy.
fn read_boundaries(p: &str) -> Result<BoundaryTable> {
    let f = File::open(p).with_context(|| format!("open boundaries file {p}"))?;
    let mut per_feature: Vec<Vec<i64>> = Vec::new();
    for (lineno, line) in BufReader::new(f).lines().enumerate() {
        let line = line?;
        per_feature.push(parse_list(&line).with_context(|| format!("{p}:{}", lineno + 1))?);
    }
    Ok(BoundaryTable::new(&per_feature)?)
}

fn write_cells(out: &BucketizedBatch<i64, i64, f32>, path: &str) -> Result<()> {
    let rows = out.num_rows();

    /* -------- build every partition block in parallel -------- */
    let blocks: Vec<String> = (0..out.partition_count)
        .into_par_iter()
        .map(|p| {
            let mut s = String::new();
            for r in 0..rows {
                let cell = p * rows + r;
                let len = out.new_lengths[cell] as usize;
                if len == 0 {
                    continue;
                }
                let start = out.new_offsets[cell] as usize;
                let range = start..start + len;
                s.push_str(&format!("{p}\t{r}\t"));
                push_joined(&mut s, out.new_indices[range.clone()].iter().map(|v| v.to_string()));
                if let Some(w) = &out.new_weights {
                    s.push('\t');
                    let mut buf = ryu::Buffer::new();
                    push_joined(&mut s, w[range.clone()].iter().map(|&x| buf.format(x).to_owned()));
                }
                if let Some(pos) = &out.new_positions {
                    s.push('\t');
                    push_joined(&mut s, pos[range].iter().map(|v| v.to_string()));
                }
                s.push('\n');
            }
            s
        })
        .collect();

    let mut w = BufWriter::with_capacity(1 << 20, File::create(path).with_context(|| format!("create {path}"))?);
    let mut header = String::from("partition\trow\tindices");
    if out.new_weights.is_some() {
        header.push_str("\tweights");
    }
    if out.new_positions.is_some() {
        header.push_str("\tpositions");
    }
    writeln!(w, "{header}")?;
    for b in &blocks {
        w.write_all(b.as_bytes())?;
    }
    w.flush()?;
    Ok(())
}

fn push_joined(s: &mut String, items: impl Iterator<Item = String>) {
    for (k, item) in items.enumerate() {
        if k > 0 {
            s.push(',');
        }
        s.push_str(&item);
    }
}

fn write_permute(permute: &[i64], path: &str) -> Result<()> {
    let mut w = BufWriter::new(File::create(path).with_context(|| format!("create {path}"))?);
    for slot in permute {
        writeln!(w, "{slot}")?;
    }
    w.flush()?;
    Ok(())
}

fn cli() -> Command {
    let cmd = Command::new("bucketize")
        .about("Bucketize a sparse feature batch across embedding shards")
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .help("Batch in TSV format, one bag per line, feature-major")
                .required(true),
        )
        .arg(
            Arg::new("block-sizes")
                .short('b')
                .long("block-sizes")
                .help("Comma-separated block size per feature (defines the feature count)")
                .required(true),
        )
        .arg(
            Arg::new("partitions")
                .short('p')
                .long("partitions")
                .help("Number of partitions")
                .value_parser(value_parser!(usize))
                .required(true),
        )
        .arg(
            Arg::new("round-robin")
                .long("round-robin")
                .help("Comma-separated feature ids distributed round-robin"),
        )
        .arg(
            Arg::new("boundaries")
                .long("boundaries")
                .help("Per-feature boundary file, one comma-separated line per feature"),
        )
        .arg(
            Arg::new("batch-size-per-feature")
                .long("batch-size-per-feature")
                .help("Comma-separated local batch size per feature (ragged batches)")
                .requires("max-local-batch"),
        )
        .arg(
            Arg::new("max-local-batch")
                .long("max-local-batch")
                .help("Upper bound of any per-feature batch size")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("sequence")
                .long("sequence")
                .help("Emit the unbucketize permutation")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("bucketize-pos")
                .long("bucketize-pos")
                .help("Emit intra-row positions")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("keep-orig-idx")
                .long("keep-orig-idx")
                .help("Write original keys instead of partition-relative ones")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .help("Output cells in TSV format")
                .default_value("bucketized.tsv"),
        )
        .arg(
            Arg::new("permute-output")
                .long("permute-output")
                .help("Write the unbucketize permutation, one slot per line")
                .requires("sequence"),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .help("Worker threads (default: all cores)")
                .value_parser(value_parser!(usize)),
        );
    #[cfg(feature = "gpu")]
    let cmd = cmd.arg(
        Arg::new("gpu")
            .long("gpu")
            .help("Run both passes on a CUDA device")
            .action(ArgAction::SetTrue),
    );
    cmd
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env().init();
    let m = cli().get_matches();

    /* ─────────── Rayon pool ─────────── */
    let threads = m.get_one::<usize>("threads").copied().unwrap_or_else(num_cpus::get);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .context("build rayon pool")?;

    /* ─────────── Parameters ─────────── */
    let block_sizes: Vec<i64> = parse_list(m.get_one::<String>("block-sizes").map_or("", String::as_str))
        .context("--block-sizes")?;
    let nfeat = block_sizes.len();
    let mut dist_type = vec![0i32; nfeat];
    if let Some(rr) = m.get_one::<String>("round-robin") {
        for t in parse_list::<usize>(rr).context("--round-robin")? {
            ensure!(t < nfeat, "--round-robin feature {t} but only {nfeat} features");
            dist_type[t] = 1;
        }
    }
    let boundaries = m
        .get_one::<String>("boundaries")
        .map(String::as_str)
        .map(read_boundaries)
        .transpose()?;
    let bspf: Option<Vec<i64>> = m
        .get_one::<String>("batch-size-per-feature")
        .map(String::as_str)
        .map(parse_list)
        .transpose()
        .context("--batch-size-per-feature")?;
    let partitions = *m.get_one::<usize>("partitions").context("--partitions")?;

    let mut params = BucketizeParams::new(partitions, &block_sizes, &dist_type)
        .sequence(m.get_flag("sequence"))
        .bucketize_pos(m.get_flag("bucketize-pos"))
        .keep_orig_idx(m.get_flag("keep-orig-idx"));
    if let Some(tbl) = &boundaries {
        params = params.boundaries(tbl);
    }
    if let Some(bspf) = &bspf {
        let max_local_batch = m.get_one::<usize>("max-local-batch").copied().unwrap_or(0);
        params = params.ragged(bspf, max_local_batch);
    }

    /* ─────────── Read batch ─────────── */
    info!("Start parsing input.");
    let input = m.get_one::<String>("input").context("--input")?;
    let raw = read_batch(input)?;
    let mut batch: SparseBatch<'_, i64, i64, f32> = SparseBatch::new(&raw.lengths, &raw.indices);
    if let Some(w) = &raw.weights {
        batch = batch.with_weights(w);
    }
    info!(
        "{} bags, {} indices, {} features, {} partitions",
        raw.lengths.len(),
        raw.indices.len(),
        nfeat,
        partitions
    );

    /* ─────────── Bucketize ─────────── */
    let t0 = Instant::now();
    #[cfg(feature = "gpu")]
    let out = if m.get_flag("gpu") {
        sparse_bucketize::gpu::bucketize_gpu(&batch, &params, &Default::default())?
    } else {
        bucketize(&batch, &params)?
    };
    #[cfg(not(feature = "gpu"))]
    let out = bucketize(&batch, &params)?;
    info!("bucketized in {} ms", t0.elapsed().as_millis());

    /* ─────────── Write output ─────────── */
    info!("Start writing output.");
    let out_file = m.get_one::<String>("output").context("--output")?;
    write_cells(&out, out_file)?;
    if let Some(p) = m.get_one::<String>("permute-output") {
        let permute = out
            .unbucketize_permute
            .as_deref()
            .context("permutation requested without --sequence")?;
        write_permute(permute, p)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list::<i64>("1, 2,3").unwrap(), vec![1, 2, 3]);
        assert!(parse_list::<i64>("").unwrap().is_empty());
        assert!(parse_list::<i64>("1,x").is_err());
    }

    #[test]
    fn test_read_batch_weighted() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# two bags and an empty one").unwrap();
        writeln!(f, "1,2\t0.5,1.5").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "7\t2").unwrap();
        let b = read_batch(f.path().to_str().unwrap()).unwrap();
        assert_eq!(b.lengths, vec![2, 0, 1]);
        assert_eq!(b.indices, vec![1, 2, 7]);
        assert_eq!(b.weights, Some(vec![0.5, 1.5, 2.0]));
    }

    #[test]
    fn test_read_batch_rejects_partial_weights() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "1,2\t0.5,1.5").unwrap();
        writeln!(f, "3").unwrap();
        assert!(read_batch(f.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_cli_definition() {
        cli().debug_assert();
    }
}
