//! End-to-end runs of the training loop over local worker threads

use clap::Parser;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tpzero_pretrain::checkpoint::CheckpointManager;
use tpzero_pretrain::throughput::Throughput;
use tpzero_pretrain::{run, RunConfig, RunContext, RunEnv, TrainArgs};

const SEQ_LEN: usize = 8;
const VOCAB: u32 = 16;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    /// Model config plus a dataset of `samples` sequences.
    fn new(samples: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("model");
        fs::create_dir_all(&model).unwrap();
        fs::write(
            model.join("config.json"),
            r#"{"vocab_size": 16, "hidden_size": 8, "num_hidden_layers": 4,
                "max_position_embeddings": 8, "initializer_range": 0.2,
                "_name_or_path": "tiny-llama"}"#,
        )
        .unwrap();

        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let lines: Vec<String> = (0..samples)
            .map(|i| {
                let ids: Vec<u32> = (0..SEQ_LEN)
                    .map(|t| ((i * 7 + t * 3) as u32) % VOCAB)
                    .collect();
                serde_json::json!({ "input_ids": ids }).to_string()
            })
            .collect();
        fs::write(data.join("train.jsonl"), lines.join("\n")).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn context(&self, extra: &[&str], env: RunEnv) -> RunContext {
        let model = self.path("model");
        let data = self.path("data");
        let output = self.path("output");
        let metrics = self.path("output/results.json");
        let golden = self.path("golden_steploss.txt");
        let mut argv = vec![
            "tpzero-pretrain",
            "--model_path",
            model.to_str().unwrap(),
            "--data_dir",
            data.to_str().unwrap(),
            "--output_dir",
            output.to_str().unwrap(),
            "--metrics_file",
            metrics.to_str().unwrap(),
            "--golden_steploss",
            golden.to_str().unwrap(),
            "--batch_size",
            "8",
            "--max_steps",
            "10",
            "--warmup_steps",
            "2",
            "--lr",
            "0.01",
            "--grad_accum_usteps",
            "4",
            "--tensor_parallel_size",
            "1",
            "--world_size",
            "2",
            "--seq_len",
            "8",
            "--num_layers",
            "2",
        ];
        argv.extend_from_slice(extra);
        let args = TrainArgs::try_parse_from(argv).unwrap();
        let config = RunConfig::from_args(args, &env).unwrap();
        RunContext::new(config, env).unwrap()
    }
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn test_one_accumulation_step_end_to_end() {
    // 64 samples over 2 data-parallel ranks: 4 batches of 8 per rank.
    let fixture = Fixture::new(64);
    let ctx = fixture.context(&["--steps_this_run", "1"], RunEnv::default());
    assert_eq!(
        Throughput::new(8, ctx.config.data_parallel_size(), 4, 10, 1).seqs_per_iteration(),
        64
    );

    let summaries = run(&ctx).unwrap();
    assert_eq!(summaries.len(), 2);
    for summary in &summaries {
        assert_eq!(summary.global_step, 1);
        assert_eq!(summary.training_ustep, 4);
        assert_eq!(summary.epoch, 0);
        assert!((summary.final_loss - summaries[0].final_loss).abs() < 1e-12);
    }
    let loss = summaries[0].final_loss;
    assert!(loss > 0.0 && loss < 10.0, "loss {loss}");

    let records = &summaries[0].records;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].step, 1);
    assert_eq!(records[0].step_loss, loss);
    assert!(records[0].throughput > 0.0);
    assert!(records[0].grad_norm.is_none());
    assert!(summaries[1].records.is_empty());

    let doc = read_json(&fixture.path("output/results.json"));
    let parameters = &doc["results"]["parameters"];
    assert_eq!(parameters["Model"], "tiny-llama");
    assert_eq!(parameters["Batch size"], 8);
    assert_eq!(parameters["Data parallel degree"], 2);
    assert_eq!(parameters["Dataset"], "data");
    assert_eq!(parameters["Data type"], "float32");
    let names: Vec<&str> = doc["results"]["metrics"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["MetricName"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec![
            "Loss",
            "Throughput",
            "Final loss",
            "Time to train",
            "Average throughput",
            "Peak throughput"
        ]
    );

    let manager = CheckpointManager::new(fixture.path("output"));
    for file in manager.expected_files(1, 2) {
        assert!(file.exists(), "missing {file:?}");
    }
    let run_dirs: Vec<String> = fs::read_dir(fixture.path("output"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("neuron_tblogs_"))
        .collect();
    assert_eq!(run_dirs.len(), 1);
    assert!(run_dirs[0].contains("_float32_w2_lr0.01_bs8_acc4_warmup2_max10_xlaTrue_"));
}

#[test]
fn test_resume_continues_from_saved_step() {
    let fixture = Fixture::new(64);
    let first = run(&fixture.context(&["--steps_this_run", "1", "--use_zero_1"], RunEnv::default()))
        .unwrap();
    assert_eq!(first[0].global_step, 1);

    let ctx = fixture.context(
        &["--steps_this_run", "2", "--use_zero_1", "--resume_ckpt", "--print_grad_norm"],
        RunEnv::default(),
    );
    let resumed = run(&ctx).unwrap();
    for summary in &resumed {
        assert_eq!(summary.global_step, 2);
        // Microsteps restart from zero on resume.
        assert_eq!(summary.training_ustep, 4);
    }
    let records = &resumed[0].records;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].step, 2);
    assert!(records[0].grad_norm.is_some());

    let meta = CheckpointManager::new(fixture.path("output"))
        .load_meta(&tpzero_dist::ParallelState::single(), true);
    // Saved by a two-rank run, so a single-rank layout must be refused.
    assert!(meta.is_err());
}

#[test]
fn test_resume_with_toggled_zero_1_is_fatal() {
    let fixture = Fixture::new(64);
    run(&fixture.context(&["--steps_this_run", "1"], RunEnv::default())).unwrap();

    let err = run(&fixture.context(
        &["--steps_this_run", "2", "--use_zero_1", "--resume_ckpt"],
        RunEnv::default(),
    ))
    .unwrap_err();
    assert!(format!("{err:#}").contains("use_zero_1"), "{err:#}");
}

#[test]
fn test_golden_mismatch_aborts_the_run() {
    let fixture = Fixture::new(64);
    fs::write(fixture.path("golden_steploss.txt"), "100.0\n").unwrap();

    let err = run(&fixture.context(&["--steps_this_run", "1"], RunEnv::default())).unwrap_err();
    assert!(format!("{err:#}").contains("golden value 100"), "{err:#}");
}

#[test]
fn test_graph_extraction_skips_telemetry() {
    let fixture = Fixture::new(64);
    fs::write(fixture.path("golden_steploss.txt"), "100.0\n").unwrap();
    let env = RunEnv::from_vars([("NEURON_EXTRACT_GRAPHS_ONLY", "1")]).unwrap();

    let summaries = run(&fixture.context(&["--steps_this_run", "1"], env)).unwrap();
    assert_eq!(summaries[0].global_step, 1);
    assert!(summaries[0].records.is_empty());

    let doc = read_json(&fixture.path("output/results.json"));
    assert!(doc["results"]["parameters"].is_object());
    assert!(doc["results"].get("metrics").is_none());
}

#[test]
fn test_empty_loader_is_fatal() {
    // 8 samples over 2 ranks is less than one batch each.
    let fixture = Fixture::new(8);
    let err = run(&fixture.context(&["--steps_this_run", "1"], RunEnv::default())).unwrap_err();
    assert!(format!("{err:#}").contains("yields no batches"), "{err:#}");
}

#[test]
fn test_accumulation_carries_across_short_epochs() {
    // 48 samples over 2 ranks: 3 batches per epoch, fewer than grad_accum_usteps.
    let fixture = Fixture::new(48);
    let summaries = run(&fixture.context(&["--steps_this_run", "2"], RunEnv::default())).unwrap();
    for summary in &summaries {
        assert_eq!(summary.global_step, 2);
        assert_eq!(summary.training_ustep, 8);
        // Microsteps 1-3 in epoch 0, step 1 at microstep 4 in epoch 1, step 2 at 8 in epoch 2.
        assert_eq!(summary.epoch, 2);
    }
    let steps: Vec<usize> = summaries[0].records.iter().map(|r| r.step).collect();
    assert_eq!(steps, vec![1, 2]);
    assert_eq!(
        summaries[0].records.iter().map(|r| r.epoch).collect::<Vec<_>>(),
        vec![1, 2]
    );
}

#[test]
fn test_missing_data_dir_fails_before_training() {
    let fixture = Fixture::new(64);
    fs::remove_dir_all(fixture.path("data")).unwrap();

    let err = run(&fixture.context(&["--steps_this_run", "1"], RunEnv::default())).unwrap_err();
    assert!(format!("{err:#}").contains("doesn't exist"));
    assert!(!fixture.path("output/results.json").exists());
}

#[test]
fn test_tensor_and_sequence_parallel_run() {
    let fixture = Fixture::new(64);
    let ctx = fixture.context(
        &[
            "--steps_this_run",
            "2",
            "--tensor_parallel_size",
            "2",
            "--world_size",
            "4",
            "--sequence_parallel_enabled",
            "--selective_checkpoint_enabled",
            "--use_mix_precision",
        ],
        RunEnv::default().with_precision_switches(true),
    );

    // 32 samples per rank: 4 batches, one step per epoch.
    let summaries = run(&ctx).unwrap();
    assert_eq!(summaries.len(), 4);
    for summary in &summaries {
        assert_eq!(summary.global_step, 2);
        assert_eq!(summary.epoch, 1);
        assert_eq!(summary.training_ustep, 8);
    }
    assert_eq!(summaries[0].records.len(), 2);
    let manager = CheckpointManager::new(fixture.path("output"));
    for file in manager.expected_files(2, 2) {
        assert!(file.exists(), "missing {file:?}");
    }
}

fn final_loss(extra: &[&str]) -> (f64, Fixture) {
    let fixture = Fixture::new(64);
    let mut args = vec!["--steps_this_run", "2"];
    args.extend_from_slice(extra);
    let summaries = run(&fixture.context(&args, RunEnv::default())).unwrap();
    let loss = summaries[0].final_loss;
    for summary in &summaries {
        assert!((summary.final_loss - loss).abs() < 1e-12);
    }
    (loss, fixture)
}

fn tensors(path: &Path) -> Vec<(String, Vec<u8>)> {
    let bytes = fs::read(path).unwrap();
    let file = safetensors::SafeTensors::deserialize(&bytes).unwrap();
    let mut tensors: Vec<(String, Vec<u8>)> = file
        .tensors()
        .into_iter()
        .map(|(name, view)| (name, view.data().to_vec()))
        .collect();
    tensors.sort();
    tensors
}

#[test]
fn test_sequence_parallel_matches_single_tensor_rank() {
    let tp2 = [
        "--tensor_parallel_size",
        "2",
        "--world_size",
        "4",
        "--sequence_parallel_enabled",
    ];
    let (baseline, _) = final_loss(&[]);
    let (dense, dense_run) = final_loss(&tp2);
    let mut zero = tp2.to_vec();
    zero.push("--use_zero_1");
    let (sharded, sharded_run) = final_loss(&zero);

    assert!((dense - baseline).abs() < 1e-6, "{dense} vs {baseline}");
    assert!((sharded - baseline).abs() < 1e-6, "{sharded} vs {baseline}");

    // Norm gains are summed over the tensor-parallel group, so replicas stay identical.
    for fixture in [&dense_run, &sharded_run] {
        let manager = CheckpointManager::new(fixture.path("output"));
        assert_eq!(
            tensors(&manager.model_path(0)),
            tensors(&manager.model_path(1))
        );
    }
}

#[test]
fn test_logging_interval_spaces_records() {
    let fixture = Fixture::new(64);
    let ctx = fixture.context(
        &["--steps_this_run", "4", "--logging_interval", "2"],
        RunEnv::default(),
    );
    assert_eq!(
        Throughput::new(8, ctx.config.data_parallel_size(), 4, 10, 2).seqs_per_iteration(),
        128
    );

    let summaries = run(&ctx).unwrap();
    assert_eq!(summaries[0].global_step, 4);
    let steps: Vec<usize> = summaries[0].records.iter().map(|r| r.step).collect();
    assert_eq!(steps, vec![2, 4]);
    assert!(summaries[0].records.iter().all(|r| r.throughput > 0.0));
}

#[test]
fn test_shuffled_runs_are_reproducible() {
    let (plain, _) = final_loss(&[]);
    let (shuffled, _) = final_loss(&["--shuffle"]);
    let (again, _) = final_loss(&["--shuffle"]);
    assert_eq!(shuffled, again);
    assert_ne!(shuffled, plain);
}
