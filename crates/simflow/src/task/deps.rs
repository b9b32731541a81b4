use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::common::fsutils::{LinkOutcome, symlink_idempotent};
use crate::task::files::{abi_extension, irdvars_for_ext};
use crate::task::{Task, TaskRef};
use crate::{Status, TaskId, Vars, WeakRcRefCell};

/// Callback producing input variables of a consumer from the state of its producer.
pub type VarsGetter = Rc<dyn Fn(&Task) -> Vars>;

/// Something a task can depend on.
#[derive(Clone)]
pub enum DepNode {
    Task(TaskRef),
    /// File produced outside of the flow.
    File(PathBuf),
}

impl DepNode {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            DepNode::Task(task) => task.try_get().map(|t| t.id()),
            DepNode::File(_) => None,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            DepNode::Task(task) => task.try_get().map(|t| t.status()).unwrap_or(Status::Init),
            DepNode::File(path) if path.exists() => Status::Ok,
            DepNode::File(_) => Status::Error,
        }
    }

    /// Path of the file with the given role.
    pub fn opath_from_ext(&self, ext: &str) -> Option<PathBuf> {
        match self {
            DepNode::Task(task) => {
                let task = task.try_get()?;
                Some(task.dir.as_ref()?.outdir().path_from_ext(ext))
            }
            DepNode::File(path) => Some(path.clone()),
        }
    }
}

impl Debug for DepNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DepNode::Task(task) => match task.try_get() {
                Some(task) => write!(f, "Task({})", task.name()),
                None => f.write_str("Task(<borrowed>)"),
            },
            DepNode::File(path) => write!(f, "File({})", path.display()),
        }
    }
}

/// Edge to a producer together with the roles of the files that are needed.
#[derive(Clone)]
pub struct Dependency {
    node: DepNode,
    exts: Vec<String>,
    getter: Option<VarsGetter>,
}

impl Dependency {
    pub fn on_task(task: &TaskRef, exts: &[&str]) -> Self {
        Dependency {
            node: DepNode::Task(task.clone()),
            exts: exts.iter().map(|e| e.to_string()).collect(),
            getter: None,
        }
    }

    /// Dependency on an external file. Its role is derived from the file name.
    pub fn on_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let exts = abi_extension(&path).into_iter().collect();
        Dependency {
            node: DepNode::File(path),
            exts,
            getter: None,
        }
    }

    pub fn with_getter(mut self, getter: impl Fn(&Task) -> Vars + 'static) -> Self {
        self.getter = Some(Rc::new(getter));
        self
    }

    pub fn node(&self) -> &DepNode {
        &self.node
    }

    pub fn exts(&self) -> &[String] {
        &self.exts
    }

    /// Variables telling the consumer to read the files of this dependency.
    pub fn connecting_vars(&self) -> Vars {
        let mut vars = Vars::new();
        for ext in &self.exts {
            match irdvars_for_ext(ext) {
                Some(irdvars) => vars.extend(irdvars),
                None => log::debug!("No input variable is associated with role {ext}"),
            }
        }
        vars
    }

    /// Variables computed by the getter from the producer.
    pub fn apply_getter(&self) -> Option<Vars> {
        let getter = self.getter.as_ref()?;
        match &self.node {
            DepNode::Task(task) => task.try_get().map(|task| getter(&task)),
            DepNode::File(_) => None,
        }
    }

    pub fn get_filepaths_and_exts(&self) -> Vec<(PathBuf, String)> {
        self.exts
            .iter()
            .filter_map(|ext| Some((self.node.opath_from_ext(ext)?, ext.clone())))
            .collect()
    }
}

impl Debug for Dependency {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependency")
            .field("node", &self.node)
            .field("exts", &self.exts)
            .field("getter", &self.getter.is_some())
            .finish()
    }
}

/// Back edge from a producer to one of its consumers.
#[derive(Clone)]
pub(crate) struct ConsumerEdge {
    pub id: TaskId,
    pub task: WeakRcRefCell<Task>,
    pub exts: Vec<String>,
}

/// Adds `dependency` to `consumer` and registers the consumer in the producer.
pub fn add_dependency(consumer: &TaskRef, dependency: Dependency) -> crate::Result<()> {
    if let DepNode::Task(producer) = &dependency.node {
        if producer == consumer {
            return Err(crate::Error::InvariantError(format!(
                "task {} cannot depend on itself",
                consumer.get().name()
            )));
        }
        let id = consumer.get().id();
        producer.get_mut().consumers.push(ConsumerEdge {
            id,
            task: consumer.downgrade(),
            exts: dependency.exts.clone(),
        });
    }
    consumer.get_mut().deps.push(dependency);
    Ok(())
}

fn with_nc(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".nc");
    PathBuf::from(name)
}

impl Task {
    pub fn deps(&self) -> &[Dependency] {
        &self.deps
    }

    /// Tasks depending on this one that are still alive.
    pub fn consumers(&self) -> Vec<TaskRef> {
        self.consumers.iter().filter_map(|c| c.task.upgrade()).collect()
    }

    /// Links the files of the dependencies into `indata`.
    pub fn make_links(&mut self) -> crate::Result<()> {
        let indir = self.dir()?.indir().clone();
        let links: Vec<(PathBuf, String)> = self
            .deps
            .iter()
            .flat_map(|d| d.get_filepaths_and_exts())
            .collect();
        for (path, ext) in links {
            let mut src = path;
            let mut dest = indir.path_from_ext(&ext);
            if !src.exists() {
                let nc = with_nc(&src);
                if nc.exists() {
                    src = nc;
                }
            }
            if !src.exists() {
                return Err(crate::Error::GenericError(format!(
                    "{}: {} is needed by this task but it does not exist",
                    self.name,
                    src.display()
                )));
            }
            if src.extension().is_some_and(|e| e == "nc")
                && dest.extension().is_none_or(|e| e != "nc")
            {
                dest = with_nc(&dest);
            }
            match symlink_idempotent(&src, &dest)? {
                LinkOutcome::Created => {
                    log::debug!("Linked {} --> {}", src.display(), dest.display());
                }
                LinkOutcome::Existing => {}
                // After a restart the link may have been replaced by our own output.
                LinkOutcome::Conflict(target) if self.num_restarts == 0 => {
                    return Err(crate::Error::InvariantError(format!(
                        "Destination {} points to {} instead of {}",
                        dest.display(),
                        target.display(),
                        src.display()
                    )));
                }
                LinkOutcome::Conflict(_) => {}
            }
        }
        Ok(())
    }

    /// Links an arbitrary file into `indata` using the `in_<EXT>` naming.
    pub fn inlink_file(&mut self, path: &Path) -> crate::Result<PathBuf> {
        let ext = abi_extension(path).ok_or_else(|| {
            crate::Error::GenericError(format!("cannot find the role of {}", path.display()))
        })?;
        let mut dest = self.dir()?.indir().path_from_ext(&ext);
        if path.extension().is_some_and(|e| e == "nc") {
            dest = with_nc(&dest);
        }
        if !path.exists() {
            log::debug!("Creating symbolic link to missing file {}", path.display());
        }
        self.history
            .info(format!("Linking path {} --> {}", path.display(), dest.display()));
        match symlink_idempotent(path, &dest)? {
            LinkOutcome::Conflict(target) => Err(crate::Error::InvariantError(format!(
                "{} points to {} instead of {}",
                dest.display(),
                target.display(),
                path.display()
            ))),
            _ => Ok(dest),
        }
    }

    /// Sets the reading flags and the getter variables of every dependency.
    pub(crate) fn add_connecting_vars(&mut self) {
        let mut vars = Vars::new();
        for dep in &self.deps {
            vars.extend(dep.connecting_vars());
            if let Some(getter_vars) = dep.apply_getter() {
                vars.extend(getter_vars);
            }
        }
        self.input.set_vars(&vars);
    }
}

#[cfg(test)]
mod tests {
    use super::{Dependency, add_dependency};
    use crate::tests::utils::{TestEnv, scf_input};
    use crate::task::family::TaskFamily;
    use serde_json::json;

    #[test]
    fn test_connecting_vars() {
        let env = TestEnv::new();
        let scf = env.task("scf", TaskFamily::Scf, scf_input());
        let dep = Dependency::on_task(&scf, &["WFK", "DEN", "GSR"]);
        let vars = dep.connecting_vars();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars["irdwfk"], json!(1));

        let file = Dependency::on_file("/data/si_out_DEN.nc");
        assert_eq!(file.exts(), &["DEN"]);
    }

    #[test]
    fn test_add_dependency() {
        let env = TestEnv::new();
        let scf = env.task("scf", TaskFamily::Scf, scf_input());
        let nscf = env.task("nscf", TaskFamily::Nscf, scf_input());
        add_dependency(
            &nscf,
            Dependency::on_task(&scf, &["DEN"]).with_getter(|producer| {
                json!({"producer": producer.name()}).as_object().unwrap().clone()
            }),
        )
        .unwrap();
        assert_eq!(scf.get().consumers().len(), 1);
        assert!(add_dependency(&scf, Dependency::on_task(&scf, &["DEN"])).is_err());

        nscf.get_mut().add_connecting_vars();
        let nscf = nscf.get();
        assert_eq!(nscf.get_inpvar("irdden"), Some(&json!(1)));
        assert_eq!(nscf.get_inpvar("producer"), Some(&json!("scf")));
    }

    #[test]
    fn test_make_links() {
        let env = TestEnv::new();
        let scf = env.task("scf", TaskFamily::Scf, scf_input());
        let nscf = env.task("nscf", TaskFamily::Nscf, scf_input());
        add_dependency(&nscf, Dependency::on_task(&scf, &["DEN", "WFK"])).unwrap();

        let outdir = scf.get().dir().unwrap().outdir().clone();
        std::fs::write(outdir.path_in("out_DEN"), "").unwrap();
        assert!(nscf.get_mut().make_links().is_err());

        std::fs::write(outdir.path_in("out_WFK.nc"), "").unwrap();
        nscf.get_mut().make_links().unwrap();
        // idempotent
        nscf.get_mut().make_links().unwrap();

        let indir = nscf.get().dir().unwrap().indir().clone();
        assert_eq!(
            std::fs::read_link(indir.path_in("in_DEN")).unwrap(),
            outdir.path_in("out_DEN")
        );
        assert_eq!(
            std::fs::read_link(indir.path_in("in_WFK.nc")).unwrap(),
            outdir.path_in("out_WFK.nc")
        );
    }

    #[test]
    fn test_make_links_conflict() {
        let env = TestEnv::new();
        let scf = env.task("scf", TaskFamily::Scf, scf_input());
        let nscf = env.task("nscf", TaskFamily::Nscf, scf_input());
        add_dependency(&nscf, Dependency::on_task(&scf, &["DEN"])).unwrap();
        let outdir = scf.get().dir().unwrap().outdir().clone();
        std::fs::write(outdir.path_in("out_DEN"), "").unwrap();

        let indir = nscf.get().dir().unwrap().indir().clone();
        std::os::unix::fs::symlink("/elsewhere", indir.path_in("in_DEN")).unwrap();
        assert!(nscf.get_mut().make_links().is_err());
        nscf.get_mut().num_restarts = 1;
        nscf.get_mut().make_links().unwrap();
    }

    #[test]
    fn test_inlink_file() {
        let env = TestEnv::new();
        let task = env.task("t", TaskFamily::Generic, scf_input());
        let file = env.path().join("si_out_DEN.nc");
        std::fs::write(&file, "").unwrap();
        let dest = task.get_mut().inlink_file(&file).unwrap();
        assert!(dest.ends_with("indata/in_DEN.nc"));
        assert!(task.get_mut().inlink_file(&file).is_ok());
    }
}
