//! Integration tests for the EWC core: snapshot, Fisher estimation, penalty and the
//! training loop.

use std::cell::Cell;

use candle_core::{DType, Device, Tensor, Var};
use ewc_continual_rs::config::{ModelSettings, OptimizerKind};
use ewc_continual_rs::optimizer::OptimizerConfig;
use ewc_continual_rs::{
    evaluate, train_task, Batch, ContinualError, Ewc, FisherWeights, Model, ModelOutput,
    ModerationClassifier, NamedParameter, ParameterSnapshot, Result, TaskOptions,
    TensorDataLoader,
};

/// Linear regression on the two token ids of each row, with one frozen offset vector.
///
/// `prediction = x · w + b + x · frozen`, loss is the mean squared error against the label.
struct Regression {
    w: Var,
    b: Var,
    frozen: Tensor,
    forwards: Cell<usize>,
    training: bool,
    device: Device,
}

impl Regression {
    fn new() -> Self {
        let device = Device::Cpu;
        Self {
            w: Var::new(&[[0.5f32], [-0.25]], &device).unwrap(),
            b: Var::new(&[0.1f32], &device).unwrap(),
            frozen: Tensor::new(&[[0.2f32], [0.3]], &device).unwrap(),
            forwards: Cell::new(0),
            training: true,
            device,
        }
    }
}

impl Model for Regression {
    fn forward(&self, batch: &Batch) -> Result<ModelOutput> {
        self.forwards.set(self.forwards.get() + 1);
        let x = batch.input_ids.to_dtype(DType::F32)?;
        let y = batch.labels.to_dtype(DType::F32)?;
        let prediction = x
            .matmul(self.w.as_tensor())?
            .broadcast_add(self.b.as_tensor())?
            .add(&x.matmul(&self.frozen)?)?
            .squeeze(1)?;
        let loss = prediction.sub(&y)?.sqr()?.mean_all()?;
        let logits = Tensor::zeros((batch.len(), 2), DType::F32, &self.device)?;
        Ok(ModelOutput { loss, logits })
    }

    fn named_parameters(&self) -> Vec<NamedParameter> {
        vec![
            NamedParameter::trainable("b", &self.b),
            NamedParameter::frozen("frozen", &self.frozen),
            NamedParameter::trainable("w", &self.w),
        ]
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

fn regression_batch(rows: &[[u32; 2]], labels: &[u32]) -> Batch {
    let device = Device::Cpu;
    let ids: Vec<u32> = rows.iter().flatten().copied().collect();
    Batch::new(
        Tensor::from_vec(ids, (rows.len(), 2), &device).unwrap(),
        Tensor::ones((rows.len(), 2), DType::U32, &device).unwrap(),
        Tensor::new(labels, &device).unwrap(),
    )
}

fn regression_data(n: usize) -> Vec<Batch> {
    (0..n as u32)
        .map(|i| regression_batch(&[[i, 1], [2, i + 1]], &[i % 3, (i + 2) % 5]))
        .collect()
}

fn sgd<M: Model>(model: &M, lr: f64) -> ewc_continual_rs::optimizer::TaskOptimizer {
    OptimizerConfig {
        kind: OptimizerKind::Sgd,
        learning_rate: lr,
        ..OptimizerConfig::default()
    }
    .build_for(model)
    .unwrap()
}

fn flat(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

#[test]
fn test_snapshot_and_fisher_cover_exactly_the_trainable_parameters() -> Result<()> {
    let mut model = Regression::new();
    let ewc = Ewc::new(&mut model, &regression_data(3), None)?;

    assert_eq!(ewc.snapshot().len(), 2);
    assert_eq!(ewc.fisher().len(), 2);
    assert_eq!(model.trainable_parameters().len(), 2);
    for name in ["b", "w"] {
        assert!(ewc.snapshot().contains(name));
        assert!(ewc.fisher().get(name).is_some());
    }
    assert!(!ewc.snapshot().contains("frozen"));
    assert!(ewc.fisher().get("frozen").is_none());
    Ok(())
}

#[test]
fn test_fisher_is_non_negative() -> Result<()> {
    let mut model = Regression::new();
    let fisher = FisherWeights::estimate(&mut model, &regression_data(6), None)?;
    for (name, weights) in fisher.iter() {
        assert!(
            flat(weights).iter().all(|v| *v >= 0.0 && v.is_finite()),
            "negative fisher entry in {name}"
        );
    }
    Ok(())
}

#[test]
fn test_fisher_is_detached_from_the_graph() -> Result<()> {
    let mut model = Regression::new();
    let fisher = FisherWeights::estimate(&mut model, &regression_data(2), None)?;
    for (_, weights) in fisher.iter() {
        assert!(!weights.is_variable());
    }
    Ok(())
}

#[test]
fn test_penalty_zero_then_positive_after_a_step() -> Result<()> {
    let mut model = Regression::new();
    let old_task = regression_data(3);
    let ewc = Ewc::new(&mut model, &old_task, None)?;
    assert_eq!(ewc.penalty(&model)?.to_scalar::<f32>()?, 0.0);

    let mut optimizer = sgd(&model, 0.01);
    let new_task = vec![regression_batch(&[[3, 4]], &[9])];
    let options = TaskOptions {
        epochs: 1,
        ..TaskOptions::default()
    };
    train_task(&mut model, &new_task, &mut optimizer, Some(&ewc), options).average_losses()?;

    assert!(ewc.penalty(&model)?.to_scalar::<f32>()? > 0.0);
    Ok(())
}

#[test]
fn test_snapshot_survives_in_place_updates() -> Result<()> {
    let mut model = Regression::new();
    let snapshot = ParameterSnapshot::capture(&model)?;
    let before = flat(snapshot.get("w").unwrap());

    let mut optimizer = sgd(&model, 0.1);
    let options = TaskOptions {
        epochs: 2,
        ..TaskOptions::default()
    };
    train_task(&mut model, &regression_data(2), &mut optimizer, None, options).average_losses()?;

    assert_ne!(flat(model.w.as_tensor()), before);
    assert_eq!(flat(snapshot.get("w").unwrap()), before);
    Ok(())
}

#[test]
fn test_sample_limit_bounds_fisher_batches() -> Result<()> {
    let data = regression_data(5);

    let mut model = Regression::new();
    let limited = FisherWeights::estimate(&mut model, &data, Some(2))?;
    assert_eq!(limited.batches(), 2);
    assert_eq!(model.forwards.get(), 2);

    let mut model = Regression::new();
    let generous = FisherWeights::estimate(&mut model, &data, Some(50))?;
    assert_eq!(generous.batches(), 5);

    let mut model = Regression::new();
    let all = FisherWeights::estimate(&mut model, &data, None)?;
    assert_eq!(all.batches(), 5);
    assert_eq!(model.forwards.get(), 5);
    Ok(())
}

#[test]
fn test_scalar_penalty_scenario() -> Result<()> {
    struct Scalar {
        p: Var,
        device: Device,
    }

    impl Model for Scalar {
        fn forward(&self, _batch: &Batch) -> Result<ModelOutput> {
            let loss = self.p.as_tensor().sum_all()?;
            Ok(ModelOutput {
                logits: loss.clone(),
                loss,
            })
        }

        fn named_parameters(&self) -> Vec<NamedParameter> {
            vec![NamedParameter::trainable("p0", &self.p)]
        }

        fn set_training(&mut self, _training: bool) {}

        fn is_training(&self) -> bool {
            true
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    let device = Device::Cpu;
    let model = Scalar {
        p: Var::new(&[1.0f32], &device)?,
        device: device.clone(),
    };
    let snapshot = ParameterSnapshot::capture(&model)?;
    let fisher = FisherWeights::from_tensors([("p0".to_string(), Tensor::new(&[2.0f32], &device)?)], 1)?;
    let ewc = Ewc::from_parts(snapshot, fisher)?;

    model.p.set(&Tensor::new(&[1.5f32], &device)?)?;
    let penalty = ewc.penalty(&model)?.to_scalar::<f32>()?;
    assert!((penalty - 0.5).abs() < 1e-6);
    Ok(())
}

#[test]
fn test_train_task_reports_mean_of_scripted_losses() -> Result<()> {
    /// Loss of a batch is its label, independent of the parameter value.
    struct Scripted {
        w: Var,
        device: Device,
        training: bool,
    }

    impl Model for Scripted {
        fn forward(&self, batch: &Batch) -> Result<ModelOutput> {
            let label = batch.labels.to_dtype(DType::F32)?.sum_all()?;
            let loss = self.w.as_tensor().sum_all()?.affine(0.0, 0.0)?.add(&label)?;
            Ok(ModelOutput {
                logits: loss.clone(),
                loss,
            })
        }

        fn named_parameters(&self) -> Vec<NamedParameter> {
            vec![NamedParameter::trainable("w", &self.w)]
        }

        fn set_training(&mut self, training: bool) {
            self.training = training;
        }

        fn is_training(&self) -> bool {
            self.training
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    let device = Device::Cpu;
    let mut model = Scripted {
        w: Var::new(&[0.0f32], &device)?,
        device: device.clone(),
        training: false,
    };
    let data: Vec<Batch> = [4u32, 1, 7]
        .iter()
        .map(|l| {
            Batch::new(
                Tensor::new(&[[0u32]], &device).unwrap(),
                Tensor::new(&[[1u32]], &device).unwrap(),
                Tensor::new(&[*l], &device).unwrap(),
            )
        })
        .collect();
    let mut optimizer = sgd(&model, 0.5);

    let options = TaskOptions {
        task_name: "scripted".into(),
        epochs: 4,
        ..TaskOptions::default()
    };
    let reports = train_task(&mut model, &data, &mut optimizer, None, options)
        .collect::<Result<Vec<_>>>()?;

    assert!(model.is_training());
    assert_eq!(reports.len(), 4);
    for (i, report) in reports.iter().enumerate() {
        assert_eq!(report.epoch, i + 1);
        assert_eq!(report.batches, 3);
        assert!((report.average_loss - 4.0).abs() < 1e-9);
    }
    Ok(())
}

#[test]
fn test_early_stop_by_dropping_the_iterator() -> Result<()> {
    let mut model = Regression::new();
    let mut optimizer = sgd(&model, 0.01);
    let options = TaskOptions {
        epochs: 10,
        ..TaskOptions::default()
    };
    let first_two: Vec<_> = train_task(&mut model, &regression_data(2), &mut optimizer, None, options)
        .take(2)
        .collect::<Result<_>>()?;
    assert_eq!(first_two.len(), 2);
    // two epochs of two batches each
    assert_eq!(model.forwards.get(), 4);
    Ok(())
}

#[test]
fn test_empty_dataloader_raises_empty_dataset() {
    let mut model = Regression::new();
    let mut optimizer = sgd(&model, 0.01);
    let empty: Vec<Batch> = Vec::new();

    let options = TaskOptions {
        epochs: 1,
        ..TaskOptions::default()
    };
    let result = train_task(&mut model, &empty, &mut optimizer, None, options).average_losses();
    assert!(matches!(result, Err(ContinualError::EmptyDataset(_))));
}

#[test]
fn test_fisher_on_empty_data_raises_empty_dataset() {
    let mut model = Regression::new();
    let empty: Vec<Batch> = Vec::new();
    assert!(matches!(
        FisherWeights::estimate(&mut model, &empty, None),
        Err(ContinualError::EmptyDataset(_))
    ));
    assert!(matches!(
        Ewc::new(&mut model, &regression_data(3), Some(0)),
        Err(ContinualError::EmptyDataset(_))
    ));
}

fn classifier_task(device: &Device, offset: u32) -> TensorDataLoader {
    // Class k is signalled by token (offset + k); every row also carries a shared token.
    let mut ids = Vec::new();
    let mut mask = Vec::new();
    let mut labels = Vec::new();
    for i in 0..24u32 {
        let label = i % 3;
        ids.extend_from_slice(&[offset + label, 1, 0]);
        mask.extend_from_slice(&[1, 1, 0]);
        labels.push(label);
    }
    TensorDataLoader::from_rows(ids, mask, labels, 3, 6, device).unwrap()
}

#[test]
fn test_two_task_run_with_reference_classifier() -> Result<()> {
    let device = Device::Cpu;
    let settings = ModelSettings {
        hidden_size: 8,
        dropout: 0.0,
        freeze_embeddings: false,
    };
    let mut model = ModerationClassifier::new(&settings, 16, 3, &device)?;
    let task_a = classifier_task(&device, 2);
    let task_b = classifier_task(&device, 8);

    let config = OptimizerConfig {
        kind: OptimizerKind::Sgd,
        learning_rate: 0.5,
        ..OptimizerConfig::default()
    };

    let mut optimizer = config.build_for(&model)?;
    let options = TaskOptions {
        task_name: "task-a".into(),
        epochs: 30,
        ..TaskOptions::default()
    };
    let losses = train_task(&mut model, &task_a, &mut optimizer, None, options).average_losses()?;
    assert_eq!(losses.len(), 30);
    assert!(losses.iter().all(|l| l.is_finite()));
    assert!(losses[29] < losses[0]);

    let ewc = Ewc::new(&mut model, &task_a, Some(2))?;
    assert_eq!(ewc.fisher().batches(), 2);
    assert_eq!(ewc.fisher().len(), 3);

    let mut optimizer = config.build_for(&model)?;
    let options = TaskOptions {
        task_name: "task-b".into(),
        epochs: 5,
        ewc_lambda: 100.0,
        ..TaskOptions::default()
    };
    let reports = train_task(&mut model, &task_b, &mut optimizer, Some(&ewc), options)
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(reports.len(), 5);
    assert!(reports.iter().all(|r| r.average_penalty > 0.0));
    for report in &reports {
        let expected = report.average_task_loss + 50.0 * report.average_penalty;
        assert!((report.average_loss - expected).abs() < 1e-3);
    }

    let eval = evaluate(&mut model, &task_a, "task-a")?;
    assert_eq!(eval.examples, 24);
    assert!((0.0..=1.0).contains(&eval.accuracy));
    assert!(model.is_training());
    Ok(())
}
