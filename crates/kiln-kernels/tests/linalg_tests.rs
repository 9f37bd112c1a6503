use kiln_core::{DType, KilnError, Tensor};
use kiln_kernels::{lu_with_info, svd, Context, KernelConfig, LinalgBackend};

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "index {i}: {x} vs {y} (tol={tol})");
    }
}

/// `u @ diag(s) @ vᵀ` for one row-major matrix.
fn reconstruct(u: &[f64], s: &[f64], v: &[f64], m: usize, n: usize, k: usize) -> Vec<f64> {
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] = (0..k).map(|p| u[i * k + p] * s[p] * v[j * k + p]).sum();
        }
    }
    out
}

#[test]
fn test_lu_reports_failing_batch() {
    let data = [
        4.0f64, 3.0, 6.0, 3.0, // regular
        1.0, 2.0, 2.0, 4.0, // singular
        0.0, 0.0, 0.0, 0.0, // singular
    ];
    let a = Tensor::from_slice(&data, &[3, 2, 2]).unwrap();
    match lu_with_info(Context::global(), &a, true, true) {
        Err(KilnError::Factorization { op, batch, info }) => {
            assert_eq!(op, "lu");
            assert_eq!(batch, Some(1));
            assert_eq!(info, 2);
        }
        other => panic!("expected a factorization error, got {other:?}"),
    }

    let (_, _, infos) = lu_with_info(Context::global(), &a, true, false).unwrap();
    assert_eq!(infos.to_vec::<i64>().unwrap(), vec![0, 2, 1]);
}

#[test]
fn test_lu_unbatched_status() {
    let a = Tensor::from_slice(&[1.0f64, 2.0, 2.0, 4.0], &[2, 2]).unwrap();
    match lu_with_info(Context::global(), &a, true, true) {
        Err(KilnError::Factorization { batch, info, .. }) => {
            assert_eq!(batch, None);
            assert_eq!(info, 2);
        }
        other => panic!("expected a factorization error, got {other:?}"),
    }
}

#[test]
fn test_lu_f32_keeps_dtype() {
    let a = Tensor::from_f32(&[2.0, 1.0, 1.0, 3.0], &[1, 2, 2]);
    let (lu, pivots, infos) = lu_with_info(Context::global(), &a, true, true).unwrap();
    assert_eq!(lu.dtype(), DType::F32);
    assert_eq!(pivots.dtype(), DType::I64);
    assert_eq!(pivots.dims(), &[1, 2]);
    assert_eq!(infos.dims(), &[1]);
    // U(0, 0) = 2, L(1, 0) = 0.5, U(1, 1) = 2.5
    assert_close(&lu.to_f64_vec().unwrap(), &[2.0, 1.0, 0.5, 2.5], 1e-6);
}

#[test]
fn test_svd_reconstructs_batch() {
    let (m, n) = (4, 3);
    let data: Vec<f64> = (0..2 * m * n)
        .map(|i| ((i * 7 + 3) % 11) as f64 - 5.0)
        .collect();
    let a = Tensor::from_slice(&data, &[2, m, n]).unwrap();
    let (u, s, v) = svd(Context::global(), &a, true, true).unwrap();
    let k = m.min(n);
    let (u, s, v) = (
        u.to_vec::<f64>().unwrap(),
        s.to_vec::<f64>().unwrap(),
        v.to_vec::<f64>().unwrap(),
    );
    for b in 0..2 {
        let sb = &s[b * k..(b + 1) * k];
        assert!(sb.windows(2).all(|w| w[0] >= w[1]));
        let rebuilt = reconstruct(
            &u[b * m * k..(b + 1) * m * k],
            sb,
            &v[b * n * k..(b + 1) * n * k],
            m,
            n,
            k,
        );
        assert_close(&rebuilt, &data[b * m * n..(b + 1) * m * n], 1e-9);
    }
}

#[test]
fn test_svd_wide_full() {
    let data = [1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0];
    let a = Tensor::from_slice(&data, &[2, 3]).unwrap();
    let (u, s, v) = svd(Context::global(), &a, false, true).unwrap();
    assert_eq!(u.dims(), &[2, 2]);
    assert_eq!(v.dims(), &[3, 3]);
    let (u, s, v) = (
        u.to_vec::<f64>().unwrap(),
        s.to_vec::<f64>().unwrap(),
        v.to_vec::<f64>().unwrap(),
    );
    // only the first two columns of the full V pair with singular values
    let mut rebuilt = vec![0.0; 6];
    for i in 0..2 {
        for j in 0..3 {
            rebuilt[i * 3 + j] = (0..2).map(|p| u[i * 2 + p] * s[p] * v[j * 3 + p]).sum();
        }
    }
    assert_close(&rebuilt, &data, 1e-9);

    // V is orthogonal
    for p in 0..3 {
        for q in 0..3 {
            let dot: f64 = (0..3).map(|j| v[j * 3 + p] * v[j * 3 + q]).sum();
            let expected = if p == q { 1.0 } else { 0.0 };
            assert!((dot - expected).abs() < 1e-9, "V^T V [{p}, {q}] = {dot}");
        }
    }
}

#[test]
fn test_without_backend() {
    let mut config = KernelConfig::default();
    config.linalg.backend = LinalgBackend::None;
    let ctx = Context::new(config).unwrap();
    let a = Tensor::from_f32(&[1.0, 0.0, 0.0, 1.0], &[2, 2]);
    assert!(matches!(
        svd(&ctx, &a, true, true),
        Err(KilnError::Unsupported(_))
    ));
    assert!(matches!(
        lu_with_info(&ctx, &a, true, true),
        Err(KilnError::Unsupported(_))
    ));
}
