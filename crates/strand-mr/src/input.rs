//! Input descriptions for a pipeline run.

/// Opaque format tag carried on each file spec; only the runner's
/// decoders interpret it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WireFormat(pub u32);

/// One glob of input files plus their format.
#[derive(Clone, Debug)]
pub struct FileSpec {
    pub url_glob: String,
    pub format: WireFormat,
}

/// A named input: one or more file specs.
#[derive(Clone, Debug)]
pub struct InputSpec {
    pub name: String,
    pub file_specs: Vec<FileSpec>,
}

impl InputSpec {
    pub fn new(name: &str, url_glob: &str, format: WireFormat) -> Self {
        Self {
            name: name.to_string(),
            file_specs: vec![FileSpec { url_glob: url_glob.to_string(), format }],
        }
    }
}

/// One expanded file queued for a worker fiber.
#[derive(Clone, Debug)]
pub struct FileInput {
    pub path: String,
    pub format: WireFormat,
}
