// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use clap;
use log::info;
use serde::{de::DeserializeOwned, Serialize};
use serde_json;
use std::default::Default;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

/// Suffix of the staging file a `JsonReportFile` is written to before being
/// renamed into place.
pub const STAGING_SUFFIX: &str = "-tmp";

fn read_json<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut f = fs::OpenOptions::new().read(true).open(path)?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;

    // Comment lines are blanked rather than dropped to keep line numbers in
    // parse errors meaningful.
    let mut body = String::new();
    for line in buf.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with("//") && !trimmed.starts_with("#") {
            body += line;
        }
        body += "\n";
    }
    Ok(body)
}

pub fn staging_path<P: AsRef<Path>>(path: P) -> PathBuf {
    let mut st = path.as_ref().to_path_buf().into_os_string();
    st.push(STAGING_SUFFIX);
    PathBuf::from(st)
}

pub trait JsonLoad
where
    Self: DeserializeOwned,
{
    fn loaded(&mut self) -> Result<()> {
        Ok(())
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let body = read_json(path).with_context(|| format!("failed to read {:?}", path))?;
        let mut data = serde_json::from_str::<Self>(&body)
            .with_context(|| format!("failed to parse {:?}", path))?;
        data.loaded()?;
        Ok(data)
    }
}

pub trait JsonSave
where
    Self: Serialize,
{
    fn preamble() -> Option<String> {
        None
    }

    fn as_json(&self) -> Result<String> {
        let mut serialized = serde_json::to_string_pretty(&self)?;
        if !serialized.ends_with("\n") {
            serialized += "\n";
        }
        match Self::preamble() {
            Some(pre) => Ok(pre + &serialized),
            None => Ok(serialized),
        }
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        f.write_all(self.as_json()?.as_ref())?;
        f.sync_all()?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct JsonConfigFile<T: JsonLoad + JsonSave> {
    pub path: Option<PathBuf>,
    pub data: T,
}

impl<T: JsonLoad + JsonSave + Default> JsonConfigFile<T> {
    fn maybe_create_dfl(path: &Path) -> Result<bool> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(&parent)?;
            }
        }

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut f) => {
                let data: T = Default::default();
                f.write_all(data.as_json()?.as_ref())?;
                Ok(true)
            }
            Err(e) => match e.kind() {
                io::ErrorKind::AlreadyExists => Ok(false),
                _ => Err(e.into()),
            },
        }
    }

    pub fn load_or_create<P: AsRef<Path>>(path_opt: Option<P>) -> Result<Self> {
        match path_opt {
            Some(path_in) => {
                let path = path_in.as_ref();

                if Self::maybe_create_dfl(path)? {
                    info!("cfg: Created {:?}", path);
                }

                Ok(Self {
                    path: Some(PathBuf::from(path)),
                    data: T::load(path)?,
                })
            }
            None => {
                let mut data: T = Default::default();
                data.loaded()?;
                Ok(Self { path: None, data })
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(path) = self.path.as_deref() {
            self.data.save(&path)
        } else {
            Ok(())
        }
    }
}

pub trait JsonArgs
where
    Self: JsonLoad + JsonSave + Default,
{
    fn match_cmdline() -> clap::ArgMatches<'static>;
    fn verbosity(matches: &clap::ArgMatches) -> u32;
    /// Apply the command line on top of the loaded base. Returns whether any
    /// of the persisted fields changed.
    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool>;
}

pub trait JsonArgsHelper
where
    Self: JsonArgs,
{
    fn init_args_and_logging_nosave() -> Result<(JsonConfigFile<Self>, bool)>;
    fn save_args(args_file: &JsonConfigFile<Self>) -> Result<()>;
    fn init_args_and_logging() -> Result<JsonConfigFile<Self>>;
}

impl<T> JsonArgsHelper for T
where
    T: JsonArgs,
{
    fn init_args_and_logging_nosave() -> Result<(JsonConfigFile<T>, bool)> {
        let matches = T::match_cmdline();
        super::init_logging(T::verbosity(&matches));

        let mut args_file = JsonConfigFile::<T>::load_or_create(matches.value_of("args").as_ref())?;
        let updated = args_file.data.process_cmdline(&matches)?;

        Ok((args_file, updated))
    }

    fn save_args(args_file: &JsonConfigFile<T>) -> Result<()> {
        if let Some(path) = args_file.path.as_deref() {
            info!("Updating command line arguments file {:?}", path);
            args_file.save()?;
        }
        Ok(())
    }

    fn init_args_and_logging() -> Result<JsonConfigFile<T>> {
        let (args_file, updated) = Self::init_args_and_logging_nosave()?;
        if updated {
            Self::save_args(&args_file)?;
        }
        Ok(args_file)
    }
}

/// A JSON file handed off to an external reader. The data is written to the
/// staging path and renamed into place so that the reader either sees the
/// complete file or nothing.
#[derive(Debug)]
pub struct JsonReportFile<T: JsonSave> {
    pub path: PathBuf,
    pub staging: PathBuf,
    pub data: T,
}

impl<T: JsonSave> JsonReportFile<T> {
    pub fn new<P: AsRef<Path>>(path: P, data: T) -> Self {
        let path = PathBuf::from(path.as_ref());
        Self {
            staging: staging_path(&path),
            path,
            data,
        }
    }

    pub fn commit(&self) -> Result<()> {
        self.data
            .save(&self.staging)
            .with_context(|| format!("failed to write {:?}", &self.staging))?;
        fs::rename(&self.staging, &self.path)
            .with_context(|| format!("failed to rename {:?} to {:?}", &self.staging, &self.path))?;
        Ok(())
    }
}
