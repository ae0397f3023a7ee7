//! Memoization, reference-count conservation and lifecycle errors.

use std::cell::Cell;
use std::rc::Rc;

use lazygrad::backend::{CollectionScope, CpuBuffer, Ledger, ScopeId};
use lazygrad::config::{GraphConfig, config, with_config};
use lazygrad::kernels::UnaryOp;
use lazygrad::{ArenaBackend, Backend, CpuBackend, DenseTensor, GraphError, Session, Tensor};

/// CPU backend that counts how often `exp` runs.
#[derive(Debug, Default)]
struct CountingBackend {
    inner: CpuBackend,
    exp_calls: Cell<usize>,
}

impl CountingBackend {
    fn exp_calls(&self) -> usize {
        self.exp_calls.get()
    }
}

impl Backend for CountingBackend {
    type Buffer = CpuBuffer;

    fn name(&self) -> &str {
        "counting"
    }

    fn allocate(&self, tensor: DenseTensor) -> CpuBuffer {
        self.inner.allocate(tensor)
    }

    fn read<R>(&self, buffer: &CpuBuffer, f: impl FnOnce(&DenseTensor) -> R) -> Result<R, GraphError> {
        self.inner.read(buffer, f)
    }

    fn write<R>(
        &self,
        buffer: &CpuBuffer,
        f: impl FnOnce(&mut DenseTensor) -> R,
    ) -> Result<R, GraphError> {
        self.inner.write(buffer, f)
    }

    fn increment_ref(&self, buffer: &CpuBuffer) -> Result<(), GraphError> {
        self.inner.increment_ref(buffer)
    }

    fn release(&self, buffer: &CpuBuffer) -> Result<bool, GraphError> {
        self.inner.release(buffer)
    }

    fn open_scope(&self) -> ScopeId {
        self.inner.open_scope()
    }

    fn close_scope(&self, scope: ScopeId) -> Result<usize, GraphError> {
        self.inner.close_scope(scope)
    }

    fn ledger(&self) -> &Ledger {
        self.inner.ledger()
    }

    fn unary(&self, op: UnaryOp, x: &CpuBuffer) -> Result<CpuBuffer, GraphError> {
        if op == UnaryOp::Exp {
            self.exp_calls.set(self.exp_calls.get() + 1);
        }
        self.inner.unary(op, x)
    }
}

fn strict_nan() -> GraphConfig {
    GraphConfig {
        check_nan: true,
        ..config()
    }
}

// ============================================================================
// Memoization
// ============================================================================

#[test]
fn test_forward_computes_each_node_once_per_session() {
    let backend = Rc::new(CountingBackend::default());
    let x = Tensor::variable(&backend, vec![0.0, 1.0], &[2]).unwrap();
    let y = x.exp().unwrap();
    let z = y.add(&y).unwrap();
    let w = z.mul(&y).unwrap();
    assert_eq!(backend.exp_calls(), 0);

    let session = Session::new(&backend);
    session.forward(&w).unwrap();
    session.forward(&y).unwrap();
    session.forward(&z).unwrap();
    assert_eq!(backend.exp_calls(), 1);
    let stats = session.close().unwrap();
    assert!(stats.released_outputs >= 3);
    assert!(!y.has_value());

    // a new session starts from scratch
    let session = Session::new(&backend);
    session.forward(&w).unwrap();
    session.close().unwrap();
    assert_eq!(backend.exp_calls(), 2);
}

#[test]
fn test_kept_output_survives_sessions() {
    let backend = Rc::new(CountingBackend::default());
    let x = Tensor::variable(&backend, vec![0.5], &[1]).unwrap();
    let y = x.exp().unwrap();

    y.forward().unwrap();
    assert!(y.has_value());
    y.value().unwrap();
    y.add_scalar(1.0).unwrap().to_vec().unwrap();
    assert_eq!(backend.exp_calls(), 1);
}

#[test]
fn test_backward_evaluates_shared_node_once() {
    let backend = Rc::new(CountingBackend::default());
    let x = Tensor::variable(&backend, vec![0.0, 1.0], &[2]).unwrap();
    let y = x.exp().unwrap();
    let loss = y.square().unwrap().add(&y).unwrap().sum_all().unwrap();

    loss.backward().unwrap();
    assert_eq!(backend.exp_calls(), 1);
    let g = x.grad().unwrap();
    let e = 1.0f64.exp();
    assert_eq!(g.data()[0], 3.0);
    assert!((g.data()[1] - (2.0 * e * e + e)).abs() < 1e-12);
}

#[test]
fn test_eager_constants_skip_the_graph() {
    let backend = Rc::new(CountingBackend::default());
    let c = Tensor::constant(&backend, vec![0.0], &[1]).unwrap();
    let e = c.exp().unwrap();
    assert!(e.is_constant());
    assert_eq!(backend.exp_calls(), 1);

    let lazy = GraphConfig {
        eager_constants: false,
        ..config()
    };
    let deferred = with_config(lazy, || c.exp().unwrap());
    assert!(!deferred.is_leaf());
    assert_eq!(backend.exp_calls(), 1);
    assert_eq!(deferred.item().unwrap(), 1.0);
    assert_eq!(backend.exp_calls(), 2);
}

// ============================================================================
// Reference-count conservation
// ============================================================================

#[test]
fn test_ledger_balances_after_graph_is_dropped() {
    let cpu = Rc::new(CpuBackend::new());
    {
        let x = Tensor::variable(&cpu, vec![1.0, 2.0, 3.0], &[3]).unwrap();
        let y = Tensor::variable(&cpu, vec![4.0, 5.0, 6.0], &[3]).unwrap();
        let h = x.sub(&y).unwrap();
        let z = h.square().unwrap().sum_all().unwrap().add(&h.sum_all().unwrap()).unwrap();
        z.backward().unwrap();
        z.forward().unwrap();

        // only leaf values, gradients and the kept output remain referenced
        assert_eq!(cpu.ledger().unbalanced().len(), 5);
    }
    assert!(cpu.ledger().unbalanced().is_empty());
    let stats = cpu.ledger().stats();
    assert_eq!(stats.increments, stats.releases);
}

#[test]
fn test_every_buffer_balanced_per_session() {
    let cpu = Rc::new(CpuBackend::new());
    let x = Tensor::variable(&cpu, vec![1.0, -2.0], &[2]).unwrap();
    let before = cpu.ledger().unbalanced();

    let y = x.tanh().unwrap().mul(&x).unwrap().sum_all().unwrap();
    let session = Session::new(&cpu);
    session.forward(&y).unwrap();
    session.close().unwrap();
    assert_eq!(cpu.ledger().unbalanced(), before);

    y.backward().unwrap();
    assert_eq!(cpu.ledger().unbalanced(), before);
}

#[test]
fn test_arena_frees_intermediates_after_backward() {
    let arena = Rc::new(ArenaBackend::new());
    let x = Tensor::variable(&arena, vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let w = Tensor::constant(&arena, vec![0.5, -1.0, 2.0, 1.0], &[2, 2]).unwrap();
    let baseline = arena.live_buffers();
    assert_eq!(baseline, 3);

    let loss = x
        .matmul(&w)
        .unwrap()
        .relu()
        .unwrap()
        .add(&x.exp().unwrap())
        .unwrap()
        .mean_all()
        .unwrap();
    loss.backward().unwrap();
    assert_eq!(arena.live_buffers(), baseline);
    assert!(x.grad().unwrap().data().iter().all(|g| *g != 0.0));

    drop((loss, x, w));
    assert_eq!(arena.live_buffers(), 0);
    assert!(arena.ledger().unbalanced().is_empty());
}

#[test]
fn test_arena_releases_on_forward_error() {
    with_config(strict_nan(), || {
        let arena = Rc::new(ArenaBackend::new());
        let x = Tensor::variable(&arena, vec![-1.0, 4.0], &[2]).unwrap();
        let baseline = arena.live_buffers();

        let y = x.exp().unwrap();
        let z = y.add(&x.ln().unwrap()).unwrap();
        let session = Session::new(&arena);
        let err = session.forward(&z).unwrap_err();
        assert_eq!(err, GraphError::NanDetected { op: "ln" });
        drop(session);

        assert!(!y.has_value());
        assert_eq!(arena.live_buffers(), baseline);
    });
}

#[test]
fn test_arena_releases_on_backward_error() {
    with_config(strict_nan(), || {
        let arena = Rc::new(ArenaBackend::new());
        let x = Tensor::variable(&arena, vec![-1.0, 4.0], &[2]).unwrap();
        let baseline = arena.live_buffers();

        let loss = x.exp().unwrap().add(&x.sqrt().unwrap()).unwrap().sum_all().unwrap();
        assert!(matches!(loss.backward(), Err(GraphError::NanDetected { .. })));
        assert_eq!(arena.live_buffers(), baseline);
        assert_eq!(x.grad().unwrap().data(), &[0.0, 0.0]);

        let scope = CollectionScope::open(&arena);
        let wrong = arena.zeros(&[3]);
        let pre = x.exp().unwrap();
        assert!(matches!(
            pre.backward_with(&wrong),
            Err(GraphError::ShapeMismatch { op: "backward", .. })
        ));
        assert_eq!(scope.close().unwrap(), 1);
        assert_eq!(arena.live_buffers(), baseline);
    });
}

#[test]
fn test_arena_detects_use_after_free() {
    let arena = Rc::new(ArenaBackend::new());
    let x = Tensor::variable(&arena, vec![1.0], &[1]).unwrap();
    let buffer = x.forward().unwrap();
    x.release().unwrap();
    assert!(!arena.is_live(&buffer));
    assert!(matches!(
        arena.to_vec(&buffer),
        Err(GraphError::BufferReleased { .. })
    ));
}

#[test]
fn test_ledger_stays_bounded_over_many_passes() {
    fn train<B: Backend>(backend: &Rc<B>) {
        let x = Tensor::variable(backend, vec![1.0, 2.0], &[2]).unwrap();
        for _ in 0..1000 {
            x.square().unwrap().sum_all().unwrap().backward().unwrap();
        }
        assert_eq!(x.grad().unwrap().data(), &[2000.0, 4000.0]);

        // only the leaf value and its gradient remain
        let ledger = backend.ledger();
        assert_eq!(ledger.tracked(), 2);
        let stats = ledger.stats();
        assert_eq!(stats.live, 2);
        assert_eq!(stats.allocations - stats.frees, 2);
        assert!(stats.allocations > 2000);
    }
    train(&Rc::new(CpuBackend::new()));
    train(&Rc::new(ArenaBackend::new()));
}

#[test]
fn test_sessions_closed_out_of_order_recover() {
    let arena = Rc::new(ArenaBackend::new());
    let x = Tensor::variable(&arena, vec![1.0, 2.0], &[2]).unwrap();
    let first = Session::new(&arena);
    let second = Session::new(&arena);
    assert!(matches!(first.close(), Err(GraphError::InvalidOperation(_))));
    drop(second);
    assert_eq!(arena.open_scopes(), 0);

    for _ in 0..10 {
        x.square().unwrap().sum_all().unwrap().backward().unwrap();
    }
    let session = Session::new(&arena);
    let temp = arena.zeros(&[3]);
    session.close().unwrap();
    assert!(!arena.is_live(&temp));
    assert_eq!(arena.live_buffers(), 2);
}

// ============================================================================
// Lifecycle misuse
// ============================================================================

#[test]
fn test_release_twice_fails() {
    let cpu = Rc::new(CpuBackend::new());
    let x = Tensor::variable(&cpu, vec![1.0], &[1]).unwrap();
    x.release().unwrap();
    let err = x.release().unwrap_err();
    assert!(matches!(err, GraphError::NodeReleased { .. }));
    assert!(err.is_lifecycle());

    let raw = cpu.scalar(1.0);
    cpu.increment_ref(&raw).unwrap();
    assert!(cpu.release(&raw).unwrap());
    assert!(matches!(cpu.release(&raw), Err(GraphError::AlreadyReleased { .. })));
}

#[test]
fn test_released_node_rejects_backward_and_new_consumers() {
    let cpu = Rc::new(CpuBackend::new());
    let x = Tensor::variable(&cpu, vec![1.0], &[1]).unwrap();
    let y = x.square().unwrap();
    y.release().unwrap();
    assert!(matches!(y.backward(), Err(GraphError::NodeReleased { .. })));
    assert!(matches!(y.exp(), Err(GraphError::NodeReleased { .. })));
    assert!(matches!(y.release(), Err(GraphError::NodeReleased { .. })));
}

#[test]
fn test_gradient_of_non_variable() {
    let cpu = Rc::new(CpuBackend::new());
    let x = Tensor::variable(&cpu, vec![1.0], &[1]).unwrap();
    let c = Tensor::constant(&cpu, vec![1.0], &[1]).unwrap();
    let y = x.add(&c).unwrap();
    assert!(matches!(c.grad(), Err(GraphError::NoGradient { .. })));
    assert!(matches!(y.grad(), Err(GraphError::NoGradient { .. })));
    assert!(matches!(c.zero_grad(), Err(GraphError::NoGradient { .. })));
}

#[test]
fn test_non_scalar_backward_is_rejected() {
    let cpu = Rc::new(CpuBackend::new());
    let x = Tensor::variable(&cpu, vec![1.0, 2.0], &[2]).unwrap();
    let y = x.square().unwrap();
    assert_eq!(
        y.backward().unwrap_err(),
        GraphError::NonScalarBackward { shape: vec![2] }
    );
    assert_eq!(x.grad().unwrap().data(), &[0.0, 0.0]);
}

#[test]
fn test_mixing_backends_is_rejected() {
    let a = Rc::new(CpuBackend::new());
    let b = Rc::new(CpuBackend::new());
    let x = Tensor::variable(&a, vec![1.0], &[1]).unwrap();
    let y = Tensor::variable(&b, vec![1.0], &[1]).unwrap();
    assert_eq!(
        x.add(&y).unwrap_err(),
        GraphError::BackendMismatch { op: "add" }
    );

    let session = Session::new(&b);
    assert!(matches!(session.forward(&x), Err(GraphError::BackendMismatch { .. })));
}
