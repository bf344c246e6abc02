// Python Controller
use numpy::{IntoPyArray, PyArray1, PyArray2, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::config::MachineConfig;
use crate::engine::controller::PimRuntime;
use crate::engine::workloads;
use crate::error::PimError;

fn to_py_err(err: PimError) -> PyErr {
    if err.is_configuration() {
        PyValueError::new_err(err.to_string())
    } else {
        PyRuntimeError::new_err(err.to_string())
    }
}

#[pyclass]
pub struct PimController {
    runtime: Option<PimRuntime>, // None until initialize()
    config: MachineConfig,
}

impl PimController {
    fn runtime(&self) -> PyResult<&PimRuntime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("runtime not initialized"))
    }
}

#[pymethods]
impl PimController {
    #[new]
    #[pyo3(signature = (num_nodes = 4, nr_lanes = 16))]
    pub fn new(num_nodes: usize, nr_lanes: usize) -> PyResult<Self> {
        let config = MachineConfig {
            num_nodes,
            nr_lanes,
            ..MachineConfig::default()
        }
        .with_env_overrides()
        .map_err(to_py_err)?;
        Ok(Self {
            runtime: None,
            config,
        })
    }

    /// Phase 1: bring up the nodes
    pub fn initialize(&mut self) -> PyResult<()> {
        crate::telemetry::init_logging();
        let runtime = PimRuntime::new(self.config.clone()).map_err(to_py_err)?;
        self.runtime = Some(runtime);
        Ok(())
    }

    pub fn run_axpy<'py>(
        &self,
        py: Python<'py>,
        x: PyReadonlyArray1<'py, f64>,
        y: PyReadonlyArray1<'py, f64>,
        alpha: f64,
    ) -> PyResult<Bound<'py, PyArray1<f64>>> {
        let rt = self.runtime()?;
        let (x, y) = (x.as_slice()?, y.as_slice()?);
        let z = py
            .allow_threads(|| workloads::run_axpy(rt, x, y, alpha))
            .map_err(to_py_err)?;
        Ok(z.into_pyarray(py))
    }

    pub fn run_matmul<'py>(
        &self,
        py: Python<'py>,
        a: PyReadonlyArray2<'py, f64>,
        b: PyReadonlyArray2<'py, f64>,
    ) -> PyResult<Bound<'py, PyArray2<f64>>> {
        let rt = self.runtime()?;
        let (a, b) = (a.as_array(), b.as_array());
        let (m, k) = a.dim();
        let (k_b, n) = b.dim();
        if k != k_b {
            return Err(PyValueError::new_err(format!(
                "inner dimensions differ: {m}x{k} by {k_b}x{n}"
            )));
        }
        let a: Vec<f64> = a.iter().copied().collect();
        let b: Vec<f64> = b.iter().copied().collect();
        let c = py
            .allow_threads(|| workloads::run_matmul(rt, &a, &b, m, k, n))
            .map_err(to_py_err)?;
        Ok(c.into_pyarray(py))
    }

    /// Returns the per-node histograms, one row per node.
    #[pyo3(signature = (values, bins = workloads::HISTOGRAM_BINS, depth = workloads::HISTOGRAM_DEPTH))]
    pub fn run_histogram<'py>(
        &self,
        py: Python<'py>,
        values: PyReadonlyArray1<'py, u32>,
        bins: u32,
        depth: u32,
    ) -> PyResult<Bound<'py, PyArray2<u32>>> {
        let rt = self.runtime()?;
        let values = values.as_slice()?;
        let run = py
            .allow_threads(|| workloads::run_histogram(rt, values, bins, depth))
            .map_err(to_py_err)?;
        Ok(run.per_node.into_pyarray(py))
    }
}

/// Python module definition
#[pymodule]
fn pim_core(_py: Python, m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PimController>()?;
    Ok(())
}
