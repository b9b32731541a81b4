//! Layout of the working directory of a task.
//!
//! ```text
//! <workdir>/
//!     run.abi  run.abo  run.log  run.err  job.sh  queue.qout  queue.qerr
//!     __startlock__  __ABI_MPIABORTFILE__  autoparal.json
//!     indata/in_<EXT>   outdata/out_<EXT>   tmpdata/tmp_<EXT>
//!     _reset/
//! ```
//!
//! Produced files are named `<prefix>_<EXT>[.nc]` where `EXT` is the role of the file
//! (`DEN`, `WFK`, ...). Dependencies are resolved through this convention.

use nom::bytes::complete::tag;
use nom::character::complete::{char, digit1};
use nom::combinator::{map_res, opt};
use nom::sequence::tuple;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::Vars;
use crate::common::fsutils::remove_if_exists;
use crate::common::parser::{NomResult, consume_all};

pub const INPUT_FILE: &str = "run.abi";
pub const OUTPUT_FILE: &str = "run.abo";
pub const JOB_FILE: &str = "job.sh";
pub const LOG_FILE: &str = "run.log";
pub const STDERR_FILE: &str = "run.err";
pub const START_LOCKFILE: &str = "__startlock__";
pub const QOUT_FILE: &str = "queue.qout";
pub const QERR_FILE: &str = "queue.qerr";
pub const MPIABORT_FILE: &str = "__ABI_MPIABORTFILE__";
pub const AUTOPARAL_FILE: &str = "autoparal.json";
pub const RESET_DIR: &str = "_reset";
pub const RESET_COUNTER: &str = "_counter";

const NC_EXT: &str = ".nc";

/// Input variable telling the external program to read a file with the given role.
pub fn irdvars_for_ext(ext: &str) -> Option<Vars> {
    let (name, value): (&str, Value) = match ext {
        "DEN" => ("irdden", 1.into()),
        "WFK" => ("irdwfk", 1.into()),
        "WFQ" => ("irdwfq", 1.into()),
        "SCR" => ("irdscr", 1.into()),
        "QPS" => ("irdqps", 1.into()),
        "1WF" => ("ird1wf", 1.into()),
        "1DEN" => ("ird1den", 1.into()),
        "BSR" => ("irdbsreso", 1.into()),
        "BSC" => ("irdbscoup", 1.into()),
        "HAYDR_SAVE" | "HAYDC_SAVE" => ("irdhaydock", 1.into()),
        "DDK" => ("irdddk", 1.into()),
        "EFMAS" | "EFMAS.nc" => ("irdefmas", 1.into()),
        _ => return None,
    };
    let mut vars = Vars::new();
    vars.insert(name.to_string(), value);
    Some(vars)
}

/// Role of a produced file, e.g. `DEN` for `out_DEN.nc` and `HAYDR_SAVE` for `out_HAYDR_SAVE`.
pub fn abi_extension(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let name = name.strip_suffix(NC_EXT).unwrap_or(name);
    let ext = if name.ends_with("_SAVE") {
        let mut parts = name.rsplitn(3, '_');
        let save = parts.next()?;
        let role = parts.next()?;
        parts.next()?;
        format!("{role}_{save}")
    } else {
        name.rsplit_once('_')?.1.to_string()
    };
    (!ext.is_empty()).then_some(ext)
}

fn p_numbered<'a>(
    prefix: &'a str,
    ext: &'a str,
) -> impl FnMut(&'a str) -> NomResult<'a, (Option<u32>, bool)> {
    move |input| {
        let (input, _) = tuple((tag(prefix), char('_'), tag(ext)))(input)?;
        let (input, index) = opt(map_res(digit1, |d: &str| d.parse::<u32>()))(input)?;
        let (input, nc) = opt(tag(NC_EXT))(input)?;
        Ok((input, (index, nc.is_some())))
    }
}

fn p_timden<'a>(prefix: &'a str) -> impl FnMut(&'a str) -> NomResult<'a, (u32, bool)> {
    move |input| {
        let (input, _) = tuple((tag(prefix), tag("_TIM")))(input)?;
        let (input, index) = map_res(digit1, |d: &str| d.parse::<u32>())(input)?;
        let (input, _) = tag("_DEN")(input)?;
        let (input, nc) = opt(tag(NC_EXT))(input)?;
        Ok((input, (index, nc.is_some())))
    }
}

/// File produced with an index appended to its role (e.g. `out_1WF4`).
#[derive(Clone, Debug, PartialEq)]
pub struct NumberedFile {
    pub path: PathBuf,
    pub index: Option<u32>,
    pub nc: bool,
}

/// One of the data directories of a task (`indata`, `outdata`, `tmpdata`).
#[derive(Clone, Debug)]
pub struct DataDir {
    path: PathBuf,
    prefix: &'static str,
}

impl DataDir {
    pub fn new(path: PathBuf, prefix: &'static str) -> Self {
        DataDir { path, prefix }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prefix passed to the external program, e.g. `<workdir>/outdata/out`.
    pub fn prefix_path(&self) -> PathBuf {
        self.path.join(self.prefix)
    }

    pub fn path_in(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn path_from_ext(&self, ext: &str) -> PathBuf {
        self.path.join(format!("{}_{ext}", self.prefix))
    }

    /// Path of the file with the given role, plain or netcdf.
    pub fn has_abiext(&self, ext: &str) -> Option<PathBuf> {
        let path = self.path_from_ext(ext);
        if path.exists() {
            return Some(path);
        }
        let nc = self.path.join(format!("{}_{ext}{NC_EXT}", self.prefix));
        nc.exists().then_some(nc)
    }

    /// Files in the directory sorted by name. Missing directories are empty.
    pub fn list_filepaths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() || p.is_symlink())
                .collect(),
            Err(_) => Vec::new(),
        };
        paths.sort();
        paths
    }

    fn find_numbered(&self, ext: &str) -> Vec<NumberedFile> {
        self.list_filepaths()
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?.to_string();
                consume_all(p_numbered(self.prefix, ext), &name)
                    .ok()
                    .map(|(index, nc)| NumberedFile { path, index, nc })
            })
            .collect()
    }

    /// First order wavefunctions, `out_1WF<n>[.nc]`.
    pub fn find_1wf_files(&self) -> Vec<NumberedFile> {
        self.find_numbered("1WF")
    }

    /// First order densities, `out_DEN<n>[.nc]`.
    pub fn find_1den_files(&self) -> Vec<NumberedFile> {
        self.find_numbered("DEN")
    }

    /// Density written at the last relaxation step, `out_TIM<n>_DEN[.nc]`.
    pub fn find_last_timden_file(&self) -> Option<NumberedFile> {
        self.list_filepaths()
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?.to_string();
                consume_all(p_timden(self.prefix), &name)
                    .ok()
                    .map(|(index, nc)| NumberedFile {
                        path,
                        index: Some(index),
                        nc,
                    })
            })
            .max_by_key(|f| f.index)
    }

    /// Removes the files with the given roles and returns their paths.
    pub fn remove_exts(&self, exts: &[String]) -> crate::Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for ext in exts {
            let path = self.path_from_ext(ext);
            let nc = self.path.join(format!("{}_{ext}{NC_EXT}", self.prefix));
            for path in [path, nc] {
                if remove_if_exists(&path)? {
                    removed.push(path);
                }
            }
        }
        Ok(removed)
    }

    /// Removes all files of the directory.
    pub fn clean(&self) -> crate::Result<()> {
        for path in self.list_filepaths() {
            remove_if_exists(&path)?;
        }
        Ok(())
    }
}

/// Renames `out_1WF<n>` and `out_DEN<n>` to their canonical names when a single such file exists.
pub fn fix_numbered_ofiles(outdir: &DataDir) -> crate::Result<Vec<(PathBuf, PathBuf)>> {
    let mut renamed = Vec::new();
    for ext in ["1WF", "DEN"] {
        let files: Vec<NumberedFile> = outdir
            .find_numbered(ext)
            .into_iter()
            .filter(|f| f.index.is_some())
            .collect();
        match files.as_slice() {
            [file] => {
                let suffix = if file.nc { NC_EXT } else { "" };
                let new = outdir.path_in(&format!("{}_{ext}{suffix}", outdir.prefix));
                std::fs::rename(&file.path, &new)?;
                renamed.push((file.path.clone(), new));
            }
            [] => {}
            _ => log::debug!(
                "{} files with role {ext} in {}, not renaming",
                files.len(),
                outdir.path.display()
            ),
        }
    }
    Ok(renamed)
}

/// Renames the density of the last relaxation step to `out_DEN[.nc]`.
pub fn rename_last_timden(outdir: &DataDir) -> crate::Result<Option<PathBuf>> {
    match outdir.find_last_timden_file() {
        Some(file) => {
            let suffix = if file.nc { NC_EXT } else { "" };
            let new = outdir.path_in(&format!("{}_DEN{suffix}", outdir.prefix));
            std::fs::rename(&file.path, &new)?;
            Ok(Some(new))
        }
        None => Ok(None),
    }
}

#[derive(Clone, Debug)]
pub struct TaskDir {
    workdir: PathBuf,
    indir: DataDir,
    outdir: DataDir,
    tmpdir: DataDir,
}

impl TaskDir {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        TaskDir {
            indir: DataDir::new(workdir.join("indata"), "in"),
            outdir: DataDir::new(workdir.join("outdata"), "out"),
            tmpdir: DataDir::new(workdir.join("tmpdata"), "tmp"),
            workdir,
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.workdir
    }

    pub fn indir(&self) -> &DataDir {
        &self.indir
    }

    pub fn outdir(&self) -> &DataDir {
        &self.outdir
    }

    pub fn tmpdir(&self) -> &DataDir {
        &self.tmpdir
    }

    pub fn create(&self) -> crate::Result<()> {
        for dir in [
            &self.workdir,
            &self.indir.path,
            &self.outdir.path,
            &self.tmpdir.path,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.workdir.join(name)
    }

    pub fn input_file(&self) -> PathBuf {
        self.file(INPUT_FILE)
    }

    pub fn output_file(&self) -> PathBuf {
        self.file(OUTPUT_FILE)
    }

    pub fn job_file(&self) -> PathBuf {
        self.file(JOB_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.file(LOG_FILE)
    }

    pub fn stderr_file(&self) -> PathBuf {
        self.file(STDERR_FILE)
    }

    pub fn start_lockfile(&self) -> PathBuf {
        self.file(START_LOCKFILE)
    }

    pub fn qout_file(&self) -> PathBuf {
        self.file(QOUT_FILE)
    }

    pub fn qerr_file(&self) -> PathBuf {
        self.file(QERR_FILE)
    }

    pub fn mpiabort_file(&self) -> PathBuf {
        self.file(MPIABORT_FILE)
    }

    pub fn autoparal_file(&self) -> PathBuf {
        self.file(AUTOPARAL_FILE)
    }

    pub fn reset_dir(&self) -> PathBuf {
        self.file(RESET_DIR)
    }

    /// Moves a produced file into `indata`, replacing `out` with `in` in its name.
    pub fn out_to_in(&self, out_file: &Path) -> crate::Result<PathBuf> {
        let name = out_file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                crate::Error::GenericError(format!("invalid file name {}", out_file.display()))
            })?;
        let dest = self.indir.path_in(&name.replacen("out", "in", 1));
        if dest.exists() && !dest.is_symlink() {
            log::warn!("Will overwrite {} with {}", dest.display(), out_file.display());
        }
        std::fs::rename(out_file, &dest)?;
        Ok(dest)
    }
}
