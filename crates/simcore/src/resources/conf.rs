use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Vars;

/// One way of running a task: process/thread counts, memory and the estimated efficiency.
///
/// The serialized form uses the key names emitted by the external program in its hint block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawConfiguration", into = "RawConfiguration")]
pub struct ResourceConfiguration {
    mpi_procs: u32,
    omp_threads: u32,
    /// Megabytes
    mem_per_proc: f64,
    efficiency: f64,
    vars: Vars,
}

#[derive(Serialize, Deserialize)]
struct RawConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tot_ncpus: Option<u32>,
    mpi_ncpus: u32,
    #[serde(default = "default_omp")]
    omp_ncpus: u32,
    #[serde(default)]
    mem_per_cpu: f64,
    efficiency: f64,
    #[serde(default)]
    vars: Vars,
}

fn default_omp() -> u32 {
    1
}

impl TryFrom<RawConfiguration> for ResourceConfiguration {
    type Error = crate::Error;

    fn try_from(raw: RawConfiguration) -> Result<Self, Self::Error> {
        let conf = ResourceConfiguration::new(
            raw.mpi_ncpus,
            raw.omp_ncpus,
            raw.mem_per_cpu,
            raw.efficiency,
        )?
        .with_vars(raw.vars);
        if let Some(tot) = raw.tot_ncpus {
            if tot != conf.num_cores() {
                log::debug!(
                    "Configuration reports tot_ncpus={tot} but mpi*omp={}",
                    conf.num_cores()
                );
            }
        }
        Ok(conf)
    }
}

impl From<ResourceConfiguration> for RawConfiguration {
    fn from(conf: ResourceConfiguration) -> Self {
        RawConfiguration {
            tot_ncpus: Some(conf.num_cores()),
            mpi_ncpus: conf.mpi_procs,
            omp_ncpus: conf.omp_threads,
            mem_per_cpu: conf.mem_per_proc,
            efficiency: conf.efficiency,
            vars: conf.vars,
        }
    }
}

impl ResourceConfiguration {
    pub fn new(
        mpi_procs: u32,
        omp_threads: u32,
        mem_per_proc: f64,
        efficiency: f64,
    ) -> crate::Result<Self> {
        if mpi_procs == 0 || omp_threads == 0 {
            return Err(crate::Error::HintParseError(format!(
                "invalid process/thread count: mpi={mpi_procs}, omp={omp_threads}"
            )));
        }
        let invalid = |value: f64| value.is_nan() || value < 0.0;
        if invalid(mem_per_proc) || invalid(efficiency) {
            return Err(crate::Error::HintParseError(format!(
                "invalid memory ({mem_per_proc}) or efficiency ({efficiency})"
            )));
        }
        Ok(ResourceConfiguration {
            mpi_procs,
            omp_threads,
            mem_per_proc,
            efficiency,
            vars: Vars::new(),
        })
    }

    pub fn with_vars(mut self, vars: Vars) -> Self {
        self.vars = vars;
        self
    }

    #[inline]
    pub fn mpi_procs(&self) -> u32 {
        self.mpi_procs
    }

    #[inline]
    pub fn omp_threads(&self) -> u32 {
        self.omp_threads
    }

    #[inline]
    pub fn mem_per_proc(&self) -> f64 {
        self.mem_per_proc
    }

    #[inline]
    pub fn efficiency(&self) -> f64 {
        self.efficiency
    }

    /// Extra variables that must be set in the input to use this configuration.
    #[inline]
    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    #[inline]
    pub fn num_cores(&self) -> u32 {
        self.mpi_procs * self.omp_threads
    }

    #[inline]
    pub fn speedup(&self) -> f64 {
        self.efficiency * self.num_cores() as f64
    }

    #[inline]
    pub fn tot_mem(&self) -> f64 {
        self.mem_per_proc * self.mpi_procs as f64
    }

    /// Named numeric view of the configuration used by [`Condition`](super::Condition).
    pub fn fields(&self) -> Vars {
        let mut fields = Vars::new();
        let mut put = |name: &str, value: Value| {
            fields.insert(name.to_string(), value);
        };
        put("mpi_procs", self.mpi_procs.into());
        put("mpi_ncpus", self.mpi_procs.into());
        put("omp_threads", self.omp_threads.into());
        put("omp_ncpus", self.omp_threads.into());
        put("num_cores", self.num_cores().into());
        put("tot_ncpus", self.num_cores().into());
        put("mem_per_proc", self.mem_per_proc.into());
        put("mem_per_cpu", self.mem_per_proc.into());
        put("tot_mem", self.tot_mem().into());
        put("efficiency", self.efficiency.into());
        put("speedup", self.speedup().into());
        fields
    }
}
