use rayon::prelude::*;
use thiserror::Error;

/// Number of elements reduced sequentially before partial sums are combined.
///
/// The stride does not depend on the worker count, so every reduction adds the
/// same partial sums in the same order no matter how many threads run it.
pub const REDUCTION_CHUNK: usize = 2048;

/// Errors that can occur while setting up parallel execution.
#[derive(Error, Debug, PartialEq)]
pub enum ParallelError {
    /// The thread pool failed to build.
    #[error("failed to build thread pool: {0}")]
    BuildError(String),
}

/// A bounded pool of workers running barrier-synchronized data-parallel sections.
///
/// Every method partitions its input into contiguous ranges aligned to the
/// natural block stride, runs them and joins before returning.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_threads", &self.num_threads())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool with `num_threads` workers, 0 for one per available core.
    pub fn new(num_threads: usize) -> Result<Self, ParallelError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("kornia-ba-{i}"))
            .build()
            .map_err(|e| ParallelError::BuildError(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Number of workers in the pool.
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `f` on every block of `stride` elements of `out`, with the block index.
    pub fn for_each_block<T, F>(&self, out: &mut [T], stride: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Sync + Send,
    {
        debug_assert!(stride > 0 && out.len() % stride == 0);
        self.pool.install(|| {
            out.par_chunks_mut(stride)
                .enumerate()
                .for_each(|(i, block)| f(i, block));
        });
    }

    /// Run `f` on every block of two outputs with different strides.
    pub fn for_each_block_pair<A, B, F>(
        &self,
        a: &mut [A],
        stride_a: usize,
        b: &mut [B],
        stride_b: usize,
        f: F,
    ) where
        A: Send,
        B: Send,
        F: Fn(usize, &mut [A], &mut [B]) + Sync + Send,
    {
        debug_assert!(a.len() / stride_a == b.len() / stride_b);
        self.pool.install(|| {
            a.par_chunks_mut(stride_a)
                .zip(b.par_chunks_mut(stride_b))
                .enumerate()
                .for_each(|(i, (block_a, block_b))| f(i, block_a, block_b));
        });
    }

    /// Deterministic sum of `f(i)` for `i` in `0..n`.
    pub fn sum_by<F>(&self, n: usize, f: F) -> f64
    where
        F: Fn(usize) -> f64 + Sync + Send,
    {
        let num_chunks = n.div_ceil(REDUCTION_CHUNK);
        let partials: Vec<f64> = self.pool.install(|| {
            (0..num_chunks)
                .into_par_iter()
                .map(|c| {
                    let start = c * REDUCTION_CHUNK;
                    let end = (start + REDUCTION_CHUNK).min(n);
                    (start..end).map(&f).sum::<f64>()
                })
                .collect()
        });
        partials.iter().sum()
    }

    /// Dot product `a . b`.
    pub fn dot(&self, a: &[f64], b: &[f64]) -> f64 {
        debug_assert_eq!(a.len(), b.len());
        self.sum_by(a.len(), |i| a[i] * b[i])
    }

    /// Euclidean norm `|a|`.
    pub fn norm(&self, a: &[f64]) -> f64 {
        self.dot(a, a).sqrt()
    }

    /// Largest absolute value of `a`.
    pub fn inf_norm(&self, a: &[f64]) -> f64 {
        self.pool
            .install(|| a.par_iter().map(|v| v.abs()).reduce(|| 0.0, f64::max))
    }

    /// `y += alpha * x`.
    pub fn axpy(&self, alpha: f64, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), y.len());
        self.pool.install(|| {
            y.par_chunks_mut(REDUCTION_CHUNK)
                .zip(x.par_chunks(REDUCTION_CHUNK))
                .for_each(|(yc, xc)| {
                    yc.iter_mut().zip(xc).for_each(|(yi, xi)| *yi += alpha * xi);
                });
        });
    }

    /// `y = x + beta * y`.
    pub fn xpby(&self, x: &[f64], beta: f64, y: &mut [f64]) {
        debug_assert_eq!(x.len(), y.len());
        self.pool.install(|| {
            y.par_chunks_mut(REDUCTION_CHUNK)
                .zip(x.par_chunks(REDUCTION_CHUNK))
                .for_each(|(yc, xc)| {
                    yc.iter_mut()
                        .zip(xc)
                        .for_each(|(yi, xi)| *yi = xi + beta * *yi);
                });
        });
    }

    /// `y *= s` element-wise.
    pub fn scale_elementwise(&self, s: &[f64], y: &mut [f64]) {
        debug_assert_eq!(s.len(), y.len());
        self.pool.install(|| {
            y.par_chunks_mut(REDUCTION_CHUNK)
                .zip(s.par_chunks(REDUCTION_CHUNK))
                .for_each(|(yc, sc)| yc.iter_mut().zip(sc).for_each(|(yi, si)| *yi *= si));
        });
    }
}
