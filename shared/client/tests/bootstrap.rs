use std::{
    cell::RefCell,
    collections::HashMap,
    io::{self, Write},
    rc::Rc,
    sync::{Arc, Mutex},
};

use candle_core::{DType, Device};
use pretty_assertions::assert_eq;
use sae_client::{
    run, AcceleratorProbe, BootstrapError, Collaborators, ConfigurationError, DatasetSource,
    JoinedGroup, ModelAcquirer, ProcessGroupInitializer, ResourceAcquisitionError, RunConfig,
    RunSummary, TrainerBuilder,
};
use sae_core::{PartitionError, RendezvousConfig, RunTopology, TopologyError};
use sae_data_provider::{LoadOptions, RawDataset, TextTokenizer, TokenizedDataset};
use sae_distributed::{CoordinationError, ProcessGroup};
use sae_modeling::{
    ModelConfig, ModelHandle, ModelLoadError, ModelLoadRequest, PrecisionChoice, Trainer,
};

#[derive(Default)]
struct Record {
    events: Vec<&'static str>,
    request: Option<ModelLoadRequest>,
    load_options: Option<LoadOptions>,
    trained_on: Vec<usize>,
}

type Shared = Rc<RefCell<Record>>;

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

struct FakeGroup {
    rank: usize,
    world_size: usize,
}

impl ProcessGroup for FakeGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&mut self) -> Result<(), CoordinationError> {
        Ok(())
    }
}

struct FakeGroups {
    record: Shared,
    fail: bool,
}

impl ProcessGroupInitializer for FakeGroups {
    fn init(
        &self,
        topology: &RunTopology,
        rendezvous: &RendezvousConfig,
    ) -> Result<JoinedGroup, CoordinationError> {
        if self.fail {
            return Err(CoordinationError::Timeout {
                what: format!("peers at {}", rendezvous.address()),
                after: rendezvous.timeout,
            });
        }
        self.record.borrow_mut().events.push("group");
        Ok(JoinedGroup {
            group: Box::new(FakeGroup {
                rank: topology.rank,
                world_size: topology.world_size,
            }),
            device: Device::Cpu,
        })
    }
}

struct FakeAccelerator {
    bf16: bool,
}

impl AcceleratorProbe for FakeAccelerator {
    fn supports_bf16(&self, _device: &Device) -> bool {
        self.bf16
    }
}

/// One token per character, `|` separates documents.
struct CharTokenizer;

impl TextTokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        Ok(text.chars().map(|c| c as u32).collect())
    }

    fn eos_token(&self) -> Option<&str> {
        Some("|")
    }

    fn model_max_length(&self) -> Option<usize> {
        None
    }
}

struct FakeModels {
    record: Shared,
    fail: bool,
}

impl ModelAcquirer for FakeModels {
    fn acquire(
        &self,
        request: &ModelLoadRequest,
    ) -> Result<(ModelHandle, Box<dyn TextTokenizer>), ResourceAcquisitionError> {
        let mut record = self.record.borrow_mut();
        record.events.push("model");
        record.request = Some(request.clone());
        if self.fail {
            return Err(ModelLoadError::MissingFile("config.json").into());
        }
        let model = ModelHandle::new(
            request.model.clone(),
            request.device.clone(),
            request.precision.dtype().unwrap_or(DType::F32),
            ModelConfig::default(),
            HashMap::new(),
            HashMap::new(),
        );
        Ok((model, Box::new(CharTokenizer)))
    }
}

struct FakeDatasets {
    record: Shared,
    documents: usize,
}

impl DatasetSource for FakeDatasets {
    fn load(
        &self,
        _dataset: &str,
        options: &LoadOptions,
    ) -> Result<RawDataset, ResourceAcquisitionError> {
        let mut record = self.record.borrow_mut();
        record.events.push("dataset");
        record.load_options = Some(options.clone());
        // "|abc" is four tokens, one chunk per document at ctx_len 4
        Ok(RawDataset::new(vec!["abc".to_owned(); self.documents]))
    }
}

struct FakeTrainer {
    record: Shared,
    data: TokenizedDataset,
    fail: bool,
}

impl Trainer for FakeTrainer {
    fn fit(&mut self) -> anyhow::Result<()> {
        let mut record = self.record.borrow_mut();
        record.events.push("fit");
        if self.fail {
            anyhow::bail!("loss is NaN");
        }
        record.trained_on = self.data.iter().map(|s| s.source_index).collect();
        Ok(())
    }
}

struct FakeTrainers {
    record: Shared,
    fail: bool,
}

impl TrainerBuilder for FakeTrainers {
    fn build(
        &self,
        _config: &RunConfig,
        data: TokenizedDataset,
        _model: ModelHandle,
    ) -> anyhow::Result<Box<dyn Trainer>> {
        self.record.borrow_mut().events.push("build");
        Ok(Box::new(FakeTrainer {
            record: self.record.clone(),
            data,
            fail: self.fail,
        }))
    }
}

struct Harness {
    record: Shared,
    console: SharedBuffer,
    bf16: bool,
    documents: usize,
    group_fails: bool,
    model_fails: bool,
    fit_fails: bool,
}

impl Default for Harness {
    fn default() -> Self {
        Self {
            record: Shared::default(),
            console: SharedBuffer::default(),
            bf16: true,
            documents: 10,
            group_fails: false,
            model_fails: false,
            fit_fails: false,
        }
    }
}

impl Harness {
    fn collaborators(&self) -> Collaborators {
        Collaborators {
            process_groups: Box::new(FakeGroups {
                record: self.record.clone(),
                fail: self.group_fails,
            }),
            accelerator: Box::new(FakeAccelerator { bf16: self.bf16 }),
            models: Box::new(FakeModels {
                record: self.record.clone(),
                fail: self.model_fails,
            }),
            datasets: Box::new(FakeDatasets {
                record: self.record.clone(),
                documents: self.documents,
            }),
            trainers: Box::new(FakeTrainers {
                record: self.record.clone(),
                fail: self.fit_fails,
            }),
        }
    }

    fn run(&self, env: &[(&str, &str)], args: &[&str]) -> Result<RunSummary, BootstrapError> {
        let env: HashMap<&str, &str> = env.iter().copied().collect();
        let args = ["sae-train", "pythia", "corpus", "--ctx-len", "4", "--device", "cpu"]
            .into_iter()
            .chain(args.iter().copied());
        run(
            &env,
            args,
            &self.collaborators(),
            Box::new(self.console.clone()),
        )
    }

    fn events(&self) -> Vec<&'static str> {
        self.record.borrow().events.clone()
    }
}

fn rank_env(rank: &'static str, world_size: &'static str) -> Vec<(&'static str, &'static str)> {
    vec![("LOCAL_RANK", rank), ("WORLD_SIZE", world_size)]
}

#[test]
fn single_process_run() {
    let harness = Harness::default();
    let summary = harness.run(&[], &[]).unwrap();

    assert_eq!(
        summary,
        RunSummary {
            topology: RunTopology::single_process(),
            precision: PrecisionChoice::BFloat16,
            dtype: DType::BF16,
            sequences: 10,
        }
    );
    assert_eq!(
        harness.console.contents(),
        "Training on 'corpus' (split 'train')\nStoring model weights in bfloat16\n"
    );
    assert_eq!(harness.events(), vec!["model", "dataset", "build", "fit"]);
    assert_eq!(harness.record.borrow().trained_on, (0..10).collect::<Vec<_>>());
}

#[test]
fn forwards_dataset_options() {
    let harness = Harness::default();
    harness
        .run(&[], &["--split", "validation", "--text-key", "content"])
        .unwrap();

    let record = harness.record.borrow();
    let options = record.load_options.as_ref().unwrap();
    assert_eq!(options.split, "validation");
    assert_eq!(options.text_key, "content");
    assert!(options.trust_remote_code);
    assert_eq!(
        harness.console.contents(),
        "Training on 'corpus' (split 'validation')\nStoring model weights in bfloat16\n"
    );
}

#[test]
fn distributed_ranks_train_on_disjoint_shards() {
    let ranks = ["0", "1", "2", "3"];
    let mut sizes = Vec::new();
    let mut trained_on = Vec::new();
    let mut consoles = Vec::new();
    for rank in ranks {
        let harness = Harness::default();
        let summary = harness.run(&rank_env(rank, "4"), &[]).unwrap();
        assert_eq!(summary.topology.world_size, 4);
        assert_eq!(
            harness.events(),
            vec!["group", "model", "dataset", "build", "fit"]
        );
        sizes.push(summary.sequences);
        trained_on.extend(harness.record.borrow().trained_on.clone());
        consoles.push(harness.console.contents());
    }

    assert_eq!(sizes, vec![3, 3, 2, 2]);
    assert_eq!(trained_on, (0..10).collect::<Vec<_>>());
    assert_eq!(
        consoles[0],
        "Using DDP across 4 GPUs.\n\
         Training on 'corpus' (split 'train')\n\
         Storing model weights in bfloat16\n"
    );
    assert!(consoles[1..].iter().all(String::is_empty));
}

#[test]
fn strided_sharding_is_selectable() {
    let harness = Harness::default();
    let summary = harness
        .run(&rank_env("1", "4"), &["--shard-strategy", "strided"])
        .unwrap();
    assert_eq!(summary.sequences, 3);
    assert_eq!(harness.record.borrow().trained_on, vec![1, 5, 9]);
}

#[test]
fn malformed_local_rank_fails_before_any_resource() {
    let harness = Harness::default();
    let err = harness
        .run(&[("LOCAL_RANK", "abc"), ("WORLD_SIZE", "4")], &[])
        .unwrap_err();

    assert!(matches!(
        err,
        BootstrapError::Configuration(ConfigurationError::Topology(
            TopologyError::InvalidInteger { .. }
        ))
    ));
    assert_eq!(harness.events(), Vec::<&str>::new());
    assert_eq!(harness.console.contents(), "");
}

#[test]
fn quantized_weights_are_stored_in_float16() {
    let harness = Harness::default();
    let summary = harness.run(&[], &["--load-in-8bit"]).unwrap();

    assert_eq!(summary.precision, PrecisionChoice::Float16);
    let record = harness.record.borrow();
    let request = record.request.as_ref().unwrap();
    assert_eq!(request.precision, PrecisionChoice::Float16);
    assert!(request.quantization.load_in_8bit);
    assert!(harness
        .console
        .contents()
        .ends_with("Storing model weights in float16\n"));
}

#[test]
fn without_bf16_the_model_picks_its_dtype() {
    let harness = Harness {
        bf16: false,
        ..Harness::default()
    };
    let summary = harness.run(&[], &[]).unwrap();
    assert_eq!(summary.precision, PrecisionChoice::Auto);
    assert_eq!(summary.dtype, DType::F32);
    assert!(harness
        .console
        .contents()
        .ends_with("Storing model weights in float32\n"));
}

#[test]
fn invalid_configuration_fails_after_joining() {
    let harness = Harness::default();
    let err = harness.run(&rank_env("1", "2"), &["--batch-size", "0"]).unwrap_err();

    assert!(matches!(
        err,
        BootstrapError::Configuration(ConfigurationError::Invalid(_))
    ));
    assert_eq!(harness.events(), vec!["group"]);
}

#[test]
fn failed_rendezvous_stops_the_run() {
    let harness = Harness {
        group_fails: true,
        ..Harness::default()
    };
    // arguments are only parsed after the group has formed
    let err = harness
        .run(&rank_env("0", "2"), &["--no-such-flag"])
        .unwrap_err();

    assert!(matches!(
        err,
        BootstrapError::Coordination(CoordinationError::Timeout { .. })
    ));
    assert_eq!(harness.events(), Vec::<&str>::new());
}

#[test]
fn model_failure_skips_the_dataset() {
    let harness = Harness {
        model_fails: true,
        ..Harness::default()
    };
    let err = harness.run(&[], &[]).unwrap_err();

    assert!(matches!(
        err,
        BootstrapError::ResourceAcquisition(ResourceAcquisitionError::Model(_))
    ));
    assert_eq!(harness.events(), vec!["model"]);
}

#[test]
fn more_ranks_than_sequences() {
    let harness = Harness {
        documents: 3,
        ..Harness::default()
    };
    let err = harness.run(&rank_env("0", "4"), &[]).unwrap_err();

    assert!(matches!(
        err,
        BootstrapError::Partition(PartitionError::NotEnoughSequences {
            len: 3,
            num_shards: 4
        })
    ));
    assert_eq!(harness.events(), vec!["group", "model", "dataset"]);
}

#[test]
fn trainer_errors_reach_every_rank() {
    for rank in ["0", "3"] {
        let harness = Harness {
            fit_fails: true,
            ..Harness::default()
        };
        let err = harness.run(&rank_env(rank, "4"), &[]).unwrap_err();
        assert!(matches!(err, BootstrapError::Trainer(_)));
        assert_eq!(err.to_string(), "training failed: loss is NaN");
        assert_eq!(
            harness.events(),
            vec!["group", "model", "dataset", "build", "fit"]
        );
    }
}

#[test]
fn logs_carry_the_detected_rank() {
    let logs = SharedBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_current_span(true)
        .with_writer(move || writer.clone())
        .finish();

    let harness = Harness::default();
    tracing::subscriber::with_default(subscriber, || {
        harness
            .run(
                &[("LOCAL_RANK", "1"), ("RANK", "3"), ("WORLD_SIZE", "4")],
                &[],
            )
            .unwrap();
    });

    let spans: Vec<serde_json::Value> = logs
        .contents()
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["span"].clone())
        .collect();
    assert!(!spans.is_empty());
    for span in spans {
        assert_eq!(span["name"], "run");
        assert_eq!(span["rank"], 3);
    }
}
