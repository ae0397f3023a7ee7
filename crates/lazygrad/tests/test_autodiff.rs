//! End-to-end gradient tests: the reference scenarios, fan-in accumulation
//! and central-difference checks of every differentiable operator family.

use std::rc::Rc;

use approx::{assert_relative_eq, relative_eq};
use lazygrad::{ArenaBackend, Backend, CpuBackend, GraphError, Tensor};

type Graph = Tensor<CpuBackend>;

fn cpu() -> Rc<CpuBackend> {
    Rc::new(CpuBackend::new())
}

/// Central differences of a scalar function, evaluated on constant leaves.
fn numeric_gradient<F>(backend: &Rc<CpuBackend>, data: &[f64], shape: &[usize], f: &F) -> Vec<f64>
where
    F: Fn(&Graph) -> Result<Graph, GraphError>,
{
    let h = 1e-5;
    let eval = |values: Vec<f64>| {
        let x = Tensor::constant(backend, values, shape).unwrap();
        f(&x).unwrap().item().unwrap()
    };
    (0..data.len())
        .map(|i| {
            let mut plus = data.to_vec();
            plus[i] += h;
            let mut minus = data.to_vec();
            minus[i] -= h;
            (eval(plus) - eval(minus)) / (2.0 * h)
        })
        .collect()
}

/// Compare the gradient from `backward()` with central differences.
fn check_gradient<F>(data: Vec<f64>, shape: &[usize], f: F)
where
    F: Fn(&Graph) -> Result<Graph, GraphError>,
{
    let cpu = cpu();
    let x = Tensor::variable(&cpu, data.clone(), shape).unwrap();
    f(&x).unwrap().backward().unwrap();
    let analytic = x.grad().unwrap().into_vec();
    let numeric = numeric_gradient(&cpu, &data, shape, &f);

    assert_eq!(analytic.len(), numeric.len());
    for (i, (&a, &n)) in analytic.iter().zip(&numeric).enumerate() {
        assert!(
            relative_eq!(a, n, epsilon = 1e-6, max_relative = 1e-5),
            "element {i}: analytic {a}, numeric {n}"
        );
    }
}

fn constant(like: &Graph, data: Vec<f64>, shape: &[usize]) -> Graph {
    Tensor::constant(like.backend(), data, shape).unwrap()
}

// ============================================================================
// Reference scenarios
// ============================================================================

#[test]
fn test_squared_distance() {
    let cpu = cpu();
    let x = Tensor::variable(&cpu, vec![1.0, 2.0, 3.0], &[3]).unwrap();
    let y = Tensor::variable(&cpu, vec![4.0, 5.0, 6.0], &[3]).unwrap();
    let z = x.sub(&y).unwrap().powf(2.0).unwrap().sum_all().unwrap();

    assert_eq!(z.item().unwrap(), 27.0);
    z.backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[-6.0, -6.0, -6.0]);
    assert_eq!(y.grad().unwrap().data(), &[6.0, 6.0, 6.0]);
}

#[test]
fn test_diamond_propagates_once() {
    let cpu = cpu();
    let a = Tensor::variable(&cpu, vec![2.0], &[]).unwrap();
    let b = a.mul_scalar(3.0).unwrap();
    let c = a.mul_scalar(5.0).unwrap();
    let d = b.add(&c).unwrap();

    assert_eq!(d.item().unwrap(), 16.0);
    d.backward().unwrap();
    assert_eq!(a.grad().unwrap().data(), &[8.0]);
}

#[test]
fn test_diamond_on_arena_backend() {
    let arena = Rc::new(ArenaBackend::new());
    let a = Tensor::variable(&arena, vec![2.0], &[1]).unwrap();
    let b = a.mul_scalar(3.0).unwrap();
    let c = a.mul_scalar(5.0).unwrap();
    b.add(&c).unwrap().backward().unwrap();
    assert_eq!(a.grad().unwrap().data(), &[8.0]);
}

#[test]
fn test_broadcast_gradient_is_column_sum() {
    let cpu = cpu();
    let a = Tensor::variable(&cpu, vec![0.0; 6], &[2, 3]).unwrap();
    let b = Tensor::variable(&cpu, vec![10.0, 20.0, 30.0], &[3]).unwrap();
    let out = a.add(&b).unwrap();
    assert_eq!(out.shape().unwrap().as_slice(), &[2, 3]);

    // column-major [[1, 3, 5], [2, 4, 6]]
    let upstream = cpu.from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    out.backward_with(&upstream).unwrap();

    let gb = b.grad().unwrap();
    assert_eq!(gb.shape(), &[3]);
    assert_eq!(gb.data(), &[3.0, 7.0, 11.0]);
    assert_eq!(a.grad().unwrap().data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn test_broadcast_sum_backward() {
    let cpu = cpu();
    let a = Tensor::variable(&cpu, vec![1.0; 6], &[2, 3]).unwrap();
    let b = Tensor::variable(&cpu, vec![1.0, 2.0, 3.0], &[3]).unwrap();
    a.add(&b).unwrap().sum_all().unwrap().backward().unwrap();
    assert_eq!(b.grad().unwrap().data(), &[2.0, 2.0, 2.0]);
}

// ============================================================================
// Fan-in accumulation
// ============================================================================

#[test]
fn test_fan_in_into_leaf() {
    let cpu = cpu();
    let a = Tensor::variable(&cpu, vec![0.5, -1.0], &[2]).unwrap();
    let d = a
        .exp()
        .unwrap()
        .add(&a.square().unwrap())
        .unwrap()
        .add(&a.mul_scalar(4.0).unwrap())
        .unwrap()
        .sum_all()
        .unwrap();
    d.backward().unwrap();

    let g = a.grad().unwrap();
    for (&x, &gx) in [0.5f64, -1.0].iter().zip(g.data()) {
        assert_relative_eq!(gx, x.exp() + 2.0 * x + 4.0, epsilon = 1e-12);
    }
}

#[test]
fn test_fan_in_into_shared_operation() {
    let cpu = cpu();
    let a = Tensor::variable(&cpu, vec![0.3], &[1]).unwrap();
    // h has three consumers; its own backward must run once with the sum
    let h = a.mul_scalar(2.0).unwrap();
    let d = h
        .square()
        .unwrap()
        .add(&h.exp().unwrap())
        .unwrap()
        .add(&h)
        .unwrap();
    d.backward().unwrap();

    let hv = 0.6f64;
    let expected = 2.0 * (2.0 * hv + hv.exp() + 1.0);
    assert_relative_eq!(a.grad().unwrap().data()[0], expected, epsilon = 1e-12);
}

#[test]
fn test_same_operand_twice() {
    let cpu = cpu();
    let x = Tensor::variable(&cpu, vec![3.0], &[1]).unwrap();
    let h = x.add_scalar(1.0).unwrap();
    h.mul(&h).unwrap().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[8.0]);
}

#[test]
fn test_repeated_backward_accumulates() {
    let cpu = cpu();
    let x = Tensor::variable(&cpu, vec![1.0, 2.0, 3.0], &[3]).unwrap();
    let y = Tensor::constant(&cpu, vec![4.0, 5.0, 6.0], &[3]).unwrap();
    let h = x.sub(&y).unwrap();
    let z = h.square().unwrap().sum_all().unwrap().add(&h.sum_all().unwrap()).unwrap();

    z.backward().unwrap();
    z.backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[-10.0, -10.0, -10.0]);

    x.zero_grad().unwrap();
    z.backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[-5.0, -5.0, -5.0]);
}

#[test]
fn test_overlapping_roots_backward_independently() {
    let cpu = cpu();
    let x = Tensor::variable(&cpu, vec![2.0], &[1]).unwrap();
    let shared = x.square().unwrap();
    let p = shared.mul_scalar(3.0).unwrap();
    let q = shared.add(&x).unwrap();

    p.backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[12.0]);
    q.backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[17.0]);
}

#[test]
fn test_constant_inputs_get_no_gradient() {
    let cpu = cpu();
    let x = Tensor::variable(&cpu, vec![1.0, 2.0], &[2]).unwrap();
    let c = Tensor::constant(&cpu, vec![3.0, 4.0], &[2]).unwrap();
    let z = x.mul(&c).unwrap().sum_all().unwrap();
    z.backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[3.0, 4.0]);
    assert!(matches!(c.grad(), Err(GraphError::NoGradient { .. })));
}

#[test]
fn test_backward_on_constant_graph_is_noop() {
    let cpu = cpu();
    let c = Tensor::constant(&cpu, vec![1.0, 2.0], &[2]).unwrap();
    let total = c.sum_all().unwrap();
    assert!(total.is_constant());
    total.backward().unwrap();
}

#[test]
fn test_detach_stops_gradient() {
    let cpu = cpu();
    let x = Tensor::variable(&cpu, vec![3.0], &[1]).unwrap();
    let frozen = x.square().unwrap().detach().unwrap();
    x.mul(&frozen).unwrap().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[9.0]);
}

// ============================================================================
// Deep graphs
// ============================================================================

fn chain<B: Backend>(x: &Tensor<B>, depth: usize) -> Tensor<B> {
    let mut y = x.clone();
    for _ in 0..depth {
        y = y.add_scalar(1.0).unwrap();
    }
    y
}

#[test]
fn test_long_chain_forward() {
    let cpu = cpu();
    let x = Tensor::variable(&cpu, vec![0.5], &[1]).unwrap();
    let y = chain(&x, 10_000);
    assert_eq!(y.item().unwrap(), 10_000.5);
    assert!(!y.has_value());
}

#[test]
fn test_long_chain_backward() {
    let cpu = cpu();
    let x = Tensor::variable(&cpu, vec![2.0], &[1]).unwrap();
    let y = chain(&x, 10_000);
    y.backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[1.0]);

    // every step also feeds the leaf directly
    let mut z = x.clone();
    for _ in 0..5_000 {
        z = z.add(&x).unwrap();
    }
    x.zero_grad().unwrap();
    z.sum_all().unwrap().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[5_001.0]);
}

#[test]
fn test_long_chain_on_arena_backend() {
    let arena = Rc::new(ArenaBackend::new());
    let x = Tensor::variable(&arena, vec![1.0, -1.0], &[2]).unwrap();
    let baseline = arena.live_buffers();
    let loss = chain(&x, 5_000).square().unwrap().sum_all().unwrap();
    loss.backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[2.0 * 5_001.0, 2.0 * 4_999.0]);
    assert_eq!(arena.live_buffers(), baseline);
}

#[test]
fn test_dropping_a_long_chain() {
    let cpu = cpu();
    let x = Tensor::variable(&cpu, vec![0.0], &[1]).unwrap();
    let y = chain(&x, 100_000);
    drop(y);
    assert_eq!(x.to_vec().unwrap(), vec![0.0]);
}

// ============================================================================
// Numerical gradient checks
// ============================================================================

#[test]
fn test_elementwise_gradients() {
    check_gradient(vec![0.4, 1.3, 2.2, 0.7], &[2, 2], |x| {
        x.tanh()?
            .mul(&x.sigmoid()?)?
            .add(&x.ln()?)?
            .sub(&x.sqrt()?.mul_scalar(0.5)?)?
            .sum_all()
    });
}

#[test]
fn test_scalar_op_gradients() {
    check_gradient(vec![0.5, 1.5, 3.0], &[3], |x| {
        x.rdiv_scalar(2.0)?
            .add(&x.powf(1.5)?)?
            .add(&x.rsub_scalar(1.0)?.abs()?)?
            .add(&x.div_scalar(4.0)?.neg()?)?
            .sum_all()
    });
}

#[test]
fn test_division_and_power_gradients() {
    check_gradient(vec![1.2, 0.8, 2.5], &[3], |x| {
        let c = constant(x, vec![2.0, 3.0, 0.5], &[3]);
        x.div(&c.add(x)?)?.add(&x.pow(&c)?)?.add(&c.pow(x)?)?.sum_all()
    });
}

#[test]
fn test_maximum_minimum_gradients() {
    check_gradient(vec![0.1, 2.0, -1.5, 0.9], &[4], |x| {
        let c = constant(x, vec![0.5, 0.5, 0.5, 0.5], &[4]);
        x.maximum(&c)?.mul_scalar(3.0)?.add(&x.minimum(&c)?)?.sum_all()
    });
}

#[test]
fn test_softmax_gradient() {
    check_gradient(vec![0.1, -0.4, 1.2, 0.3, 0.8, -1.0], &[2, 3], |x| {
        let e = x.exp()?;
        let probs = e.div(&e.sum(&[1], true)?)?;
        let weights = constant(x, vec![1.0, -2.0, 0.5, 3.0, 2.0, -1.0], &[2, 3]);
        probs.mul(&weights)?.sum_all()
    });
}

#[test]
fn test_reduction_gradients() {
    check_gradient(vec![0.3, 2.1, -0.7, 1.4, 0.9, -2.2], &[2, 3], |x| {
        let w = constant(x, vec![1.0, -1.0], &[2]);
        x.max(&[1], false)?
            .mul(&w)?
            .sum_all()?
            .add(&x.min(&[0], false)?.sum_all()?)?
            .add(&x.mean(&[0, 1], false)?)?
            .add(&x.mean_all()?.square()?)
    });
}

#[test]
fn test_layout_gradients() {
    check_gradient((1..=6).map(f64::from).collect(), &[2, 3], |x| {
        let a = x.narrow(1, 1, 2)?;
        let b = x.transpose(0, 1)?.narrow(0, 0, 2)?;
        let joined = Tensor::concat(&[&a, &b], 0)?;
        let weights = constant(x, (0..8).map(|i| f64::from(i) - 3.5).collect(), &[4, 2]);
        joined
            .mul(&weights)?
            .reshape(&[8])?
            .unsqueeze(0)?
            .square()?
            .sum_all()
    });
}

#[test]
fn test_set_narrow_gradient() {
    check_gradient(vec![0.5, -1.0, 2.0, 1.5], &[4], |x| {
        let patch = x.narrow(0, 0, 2)?.mul_scalar(2.0)?;
        x.set_narrow(0, 2, &patch)?.square()?.sum_all()
    });
}

#[test]
fn test_index_gradients() {
    check_gradient(vec![0.2, 1.1, -0.6, 0.9, 1.7, -1.3], &[2, 3], |x| {
        let index = constant(x, vec![2.0, 0.0, 1.0, 2.0], &[2, 2]);
        let picked = x.gather(1, &index)?.square()?.sum_all()?;
        let selected = x.index_select(1, &[2, 2, 0])?.exp()?.sum_all()?;
        picked.add(&selected)
    });
}

#[test]
fn test_matmul_gradient() {
    check_gradient(vec![0.5, -1.0, 1.5, 2.0, 0.3, -0.2], &[2, 3], |a| {
        let b = constant(a, vec![1.0, 0.5, -1.0, 2.0, 0.0, 1.5], &[3, 2]);
        a.matmul(&b)?.square()?.sum_all()
    });
    check_gradient(vec![1.0, -2.0, 0.5], &[3], |v| {
        let m = constant(v, vec![1.0, 0.5, -1.0, 2.0, 0.0, 1.5], &[2, 3]);
        m.matmul(v)?.square()?.sum_all()
    });
}

#[test]
fn test_batched_matmul_gradient() {
    let data: Vec<f64> = (0..12).map(|i| (f64::from(i) * 0.37).sin()).collect();
    check_gradient(data, &[2, 2, 3], |a| {
        let b = constant(a, (0..12).map(|i| (f64::from(i) * 0.11).cos()).collect(), &[2, 3, 2]);
        a.matmul(&b)?.square()?.sum_all()
    });
}

#[test]
fn test_gemm_gradient() {
    check_gradient(vec![0.5, -1.0, 1.5, 2.0], &[2, 2], |a| {
        let b = constant(a, vec![1.0, 0.5, -1.0, 2.0], &[2, 2]);
        let c = constant(a, vec![0.1, 0.2, 0.3, 0.4], &[2, 2]);
        Tensor::gemm(a, &b, Some(&c), 1.5, 0.5, true, false)?.square()?.sum_all()
    });
}

#[test]
fn test_conv2d_gradient() {
    let data: Vec<f64> = (0..16).map(|i| (f64::from(i) * 0.7).sin()).collect();
    check_gradient(data, &[1, 1, 4, 4], |x| {
        let w = constant(x, vec![0.5, -1.0, 0.25, 1.5, -0.5, 0.75, 1.0, -0.25], &[2, 1, 2, 2]);
        let bias = constant(x, vec![0.1, -0.2], &[2]);
        x.conv2d(&w, Some(&bias), 1, 1)?.square()?.sum_all()
    });
    check_gradient(vec![0.5, -1.0, 0.25, 1.5], &[1, 1, 2, 2], |w| {
        let x = constant(w, (0..16).map(|i| (f64::from(i) * 0.3).cos()).collect(), &[1, 1, 4, 4]);
        x.conv2d(w, None, 2, 0)?.square()?.sum_all()
    });
}

#[test]
fn test_max_pool_gradient() {
    let data: Vec<f64> = (0..16).map(|i| f64::from((i * 7) % 16) * 0.3).collect();
    check_gradient(data, &[1, 1, 4, 4], |x| x.max_pool2d(2, 2)?.square()?.sum_all());
}

#[test]
fn test_batch_norm_gradient() {
    let data = vec![0.3, -1.2, 0.8, 2.0, 1.1, 0.4, -0.5, 0.9];
    check_gradient(data, &[4, 2], |x| {
        let gamma = constant(x, vec![1.5, 0.5], &[2]);
        let beta = constant(x, vec![0.1, -0.3], &[2]);
        let weights = constant(x, (0..8).map(|i| f64::from(i) * 0.5 - 1.0).collect(), &[4, 2]);
        x.batch_norm(&gamma, &beta, 1e-5)?.mul(&weights)?.sum_all()
    });
}

// ============================================================================
// Aggregation
// ============================================================================

#[test]
fn test_aggregate_gradient() {
    check_gradient(vec![0.2, -0.5, 1.0], &[3], |x| {
        x.aggregate(|v| v.exp()?.sum_all())?.mul_scalar(2.0)
    });
}

#[test]
fn test_aggregate_alongside_outer_use() {
    let cpu = cpu();
    let x = Tensor::variable(&cpu, vec![0.0, 1.0], &[2]).unwrap();
    let inner = x.aggregate(|v| v.exp()?.sum_all()).unwrap();
    let total = inner.add(&x.sum_all().unwrap()).unwrap();
    total.backward().unwrap();

    let g = x.grad().unwrap();
    assert_relative_eq!(g.data()[0], 2.0, epsilon = 1e-12);
    assert_relative_eq!(g.data()[1], 1.0f64.exp() + 1.0, epsilon = 1e-12);
}
