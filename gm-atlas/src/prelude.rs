//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx2d, Idx3d, Image2d, Mask2d};

pub use crate::config::{AtlasConfig, DataParam, IsoComponents, Method, ModelParam, RunParam, Todo};
pub use crate::data::{IntensityWindow, LabelVolume, NiftiHeaderAttr, Plane, Registered, ScanVolume, Slice};

pub use crate::consts::label::{BACKGROUND, TISSUE};

pub use crate::dataset::home_dataset_dir_with;
pub use crate::dataset::{self, extract_dictionary, ExtractParam};

pub use crate::registration::{ExternalRegistrar, InProcessRegistrar, Registrar, RegistrationRecipe};

pub use crate::error::{AtlasError, Result};
pub use crate::model::{run, IntensityTable, Model, ModelSummary, ReducedSpace};
