use kiln_core::{DType, KilnError, Tensor};
use kiln_kernels::linear::{call_linear, linear, registered_names, LinearArg, LinearOp};
use kiln_kernels::{Context, KernelConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "index {i}: {x} vs {y} (tol={tol})");
    }
}

fn ctx(enable_fusion: bool) -> Context {
    let mut config = KernelConfig::default();
    config.linear.enable_fusion = enable_fusion;
    Context::new(config).unwrap()
}

fn random(rng: &mut StdRng, dims: &[usize]) -> Tensor {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-2.0f32..2.0)).collect();
    Tensor::from_f32(&data, dims)
}

fn identity(n: usize) -> Tensor {
    let mut data = vec![0.0f32; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Tensor::from_f32(&data, &[n, n])
}

#[test]
fn test_leaky_relu_unfused_matches_reference() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut rng = StdRng::seed_from_u64(7);
    let x = random(&mut rng, &[4, 8]);
    let y = call_linear(
        &ctx(false),
        "linear_leaky_relu",
        &x,
        &identity(8),
        None,
        &[LinearArg::Scalar(0.1)],
    )
    .unwrap();
    let expected: Vec<f32> = x
        .to_vec::<f32>()
        .unwrap()
        .iter()
        .map(|&v| v.max(0.0) + 0.1f32 * v.min(0.0))
        .collect();
    assert_eq!(y.to_vec::<f32>().unwrap(), expected);
}

#[test]
fn test_fused_matches_unfused() {
    let mut rng = StdRng::seed_from_u64(11);
    let x = random(&mut rng, &[3, 5, 6]);
    let w = random(&mut rng, &[6, 4]);
    let b = random(&mut rng, &[4]);
    let other = random(&mut rng, &[4]);
    let ops = [
        LinearOp::Relu,
        LinearOp::Gelu {
            approximate: "none".into(),
        },
        LinearOp::Gelu {
            approximate: "tanh".into(),
        },
        LinearOp::HardTanh { min: -0.5, max: 0.5 },
        LinearOp::Silu,
        LinearOp::ScalarAdd {
            scalar: 2.0,
            scale: 0.5,
        },
        LinearOp::Sum {
            accumul: other.clone(),
            alpha: 0.25,
        },
        LinearOp::Binary {
            algorithm: kiln_kernels::linear::BinaryAlgorithm::Max,
            other: other.clone(),
        },
    ];
    for op in &ops {
        let fused = linear(&ctx(true), &x, &w, Some(&b), op).unwrap();
        let unfused = linear(&ctx(false), &x, &w, Some(&b), op).unwrap();
        assert_eq!(fused.dims(), &[3, 5, 4]);
        assert_eq!(
            fused.to_vec::<f32>().unwrap(),
            unfused.to_vec::<f32>().unwrap(),
            "{}",
            op.name()
        );
    }
}

#[test]
fn test_binary_sub_is_sum_with_negated_alpha() {
    let mut rng = StdRng::seed_from_u64(3);
    let x = random(&mut rng, &[2, 3]);
    let w = random(&mut rng, &[3, 3]);
    let other = random(&mut rng, &[2, 3]);
    for fusion in [true, false] {
        let ctx = ctx(fusion);
        let sub = call_linear(
            &ctx,
            "linear_binary_sub",
            &x,
            &w,
            None,
            &[LinearArg::Tensor(other.clone()), LinearArg::Scalar(0.7)],
        )
        .unwrap();
        let sum = call_linear(
            &ctx,
            "linear_sum",
            &x,
            &w,
            None,
            &[LinearArg::Tensor(other.clone()), LinearArg::Scalar(-0.7)],
        )
        .unwrap();
        assert_eq!(sub.to_vec::<f32>().unwrap(), sum.to_vec::<f32>().unwrap());
    }
}

#[test]
fn test_plain_linear_with_bias() {
    let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let w = Tensor::from_f32(&[1.0, 0.0, 1.0, 0.0, 1.0, 1.0], &[2, 3]);
    let b = Tensor::from_f32(&[0.5, 0.5, 0.5], &[3]);
    let y = call_linear(Context::global(), "linear", &x, &w, Some(&b), &[]).unwrap();
    assert_eq!(y.dims(), &[2, 3]);
    assert_close(
        &y.to_vec::<f32>().unwrap(),
        &[1.5, 2.5, 3.5, 3.5, 4.5, 7.5],
        1e-6,
    );
}

#[test]
fn test_comparison_yields_ones_and_zeros() {
    let x = Tensor::from_f32(&[1.0, -1.0, 3.0], &[1, 3]);
    let other = Tensor::from_f32(&[0.0], &[1]);
    for fusion in [true, false] {
        let y = call_linear(
            &ctx(fusion),
            "linear_binary_gt",
            &x,
            &identity(3),
            None,
            &[LinearArg::Tensor(other.clone())],
        )
        .unwrap();
        assert_eq!(y.dtype(), DType::F32, "fusion = {fusion}");
        assert_eq!(y.to_vec::<f32>().unwrap(), vec![1.0, 0.0, 1.0]);
    }
}

#[test]
fn test_elu_scales_output() {
    let x = Tensor::from_f32(&[2.0, -1.0], &[1, 2]);
    let elu = |scale: f64, input_scale: f64| {
        linear(
            &ctx(false),
            &x,
            &identity(2),
            None,
            &LinearOp::Elu {
                alpha: 1.0,
                scale,
                input_scale,
            },
        )
    };
    let y = elu(2.0, 1.0).unwrap().to_vec::<f32>().unwrap();
    assert_close(&y, &[4.0, 2.0 * (-1.0f32).exp_m1()], 1e-6);
    assert!(matches!(elu(1.0, 2.0), Err(KilnError::Unsupported(_))));
}

#[test]
fn test_scalar_ops() {
    let x = Tensor::from_f32(&[2.0, -4.0], &[1, 2]);
    let w = identity(2);
    let mul = call_linear(
        Context::global(),
        "linear_binary_mul.Scalar",
        &x,
        &w,
        None,
        &[LinearArg::Scalar(3.0)],
    )
    .unwrap();
    assert_eq!(mul.to_vec::<f32>().unwrap(), vec![6.0, -12.0]);

    let sub = call_linear(
        Context::global(),
        "linear_binary_sub.Scalar",
        &x,
        &w,
        None,
        &[LinearArg::Scalar(1.0), LinearArg::Scalar(2.0)],
    )
    .unwrap();
    assert_eq!(sub.to_vec::<f32>().unwrap(), vec![0.0, -6.0]);

    let err = call_linear(
        Context::global(),
        "linear_binary_div.Scalar",
        &x,
        &w,
        None,
        &[LinearArg::Scalar(0.0)],
    )
    .unwrap_err();
    assert!(matches!(err, KilnError::DivisionByZero(_)));
}

#[test]
fn test_every_registered_name_runs() {
    let x = Tensor::from_f32(&[0.5, 1.5, 0.25, 2.0], &[2, 2]);
    let w = identity(2);
    let other = Tensor::from_f32(&[1.0, 2.0], &[2]);
    for name in registered_names() {
        let args: Vec<LinearArg> = match name {
            "linear" | "linear_sigmoid" | "linear_relu" | "linear_sqrt" | "linear_abs"
            | "linear_tanh" | "linear_square" | "linear_exp" | "linear_log" | "linear_round"
            | "linear_log_sigmoid" | "linear_hardswish" | "linear_mish" | "linear_silu"
            | "linear_hardsigmoid" => vec![],
            "linear_leaky_relu" | "linear_pow" => vec![LinearArg::Scalar(2.0)],
            "linear_hardtanh" => vec![LinearArg::Scalar(-1.0), LinearArg::Scalar(1.0)],
            "linear_elu" => vec![
                LinearArg::Scalar(1.0),
                LinearArg::Scalar(1.0),
                LinearArg::Scalar(1.0),
            ],
            "linear_gelu" => vec![LinearArg::Str("tanh".into())],
            "linear_sum" | "linear_binary_sub" => {
                vec![LinearArg::Tensor(other.clone()), LinearArg::Scalar(1.0)]
            }
            "linear_sum.Scalar" | "linear_binary_sub.Scalar" => {
                vec![LinearArg::Scalar(1.0), LinearArg::Scalar(1.0)]
            }
            "linear_binary_mul.Scalar" | "linear_binary_div.Scalar" => {
                vec![LinearArg::Scalar(2.0)]
            }
            _ => vec![LinearArg::Tensor(other.clone())],
        };
        let y = call_linear(Context::global(), name, &x, &w, None, &args)
            .unwrap_or_else(|e| panic!("{name}: {e}"));
        assert_eq!(y.dims(), &[2, 2], "{name}");
        assert_eq!(y.dtype(), DType::F32, "{name}");
    }
}

#[test]
fn test_integer_input_rejected() {
    let x = Tensor::from_slice(&[1i32, 2], &[1, 2]).unwrap();
    let w = Tensor::from_slice(&[1i32, 0, 0, 1], &[2, 2]).unwrap();
    assert!(matches!(
        linear(Context::global(), &x, &w, None, &LinearOp::Relu),
        Err(KilnError::UnsupportedDType(DType::I32))
    ));
}
