//! Project attribution for file heartbeats.
//!
//! Walks up from a file to the nearest project root, identified by markers
//! such as `.git`, `Cargo.toml` or `package.json`. A `.devinsight-project`
//! file is explicit intent: it wins at any level, and its first non-empty
//! line (when present) overrides the directory name.

use fs_err as fs;
use std::path::{Path, PathBuf};

/// Maximum depth to walk up when searching for a root.
pub const MAX_BOUNDARY_DEPTH: usize = 20;

pub const PROJECT_FILE: &str = ".devinsight-project";

/// Generated or vendored trees; a root found inside one is discarded.
pub const IGNORED_DIRECTORIES: &[&str] = &[
    "node_modules",
    "vendor",
    ".git",
    "__pycache__",
    "target",
    "dist",
    "build",
    ".next",
    "venv",
    ".venv",
    ".cache",
];

/// Project markers in priority order. Lower number = higher priority.
pub const PROJECT_MARKERS: &[(&str, u8)] = &[
    (PROJECT_FILE, 1),
    ("package.json", 2),
    ("Cargo.toml", 2),
    ("pyproject.toml", 2),
    ("go.mod", 2),
    ("pubspec.yaml", 2),
    ("deno.json", 2),
    (".git", 3),
    ("Makefile", 4),
    ("CMakeLists.txt", 4),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectBoundary {
    pub path: PathBuf,
    pub marker: &'static str,
    pub priority: u8,
}

impl ProjectBoundary {
    /// Display name of the project rooted here.
    pub fn name(&self) -> Option<String> {
        if self.marker == PROJECT_FILE {
            if let Some(name) = read_project_file(&self.path.join(PROJECT_FILE)) {
                return Some(name);
            }
        }
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
    }
}

/// Finds the nearest project root above `file_path`.
///
/// Returns `None` when the path does not exist or no marker is found before
/// the home directory or [`MAX_BOUNDARY_DEPTH`].
pub fn find_project_boundary(file_path: &Path) -> Option<ProjectBoundary> {
    if !file_path.exists() {
        return None;
    }

    let start = if file_path.is_dir() {
        file_path.to_path_buf()
    } else {
        file_path.parent()?.to_path_buf()
    };

    let home_dir = dirs::home_dir();
    let mut current = Some(start);
    let mut depth = 0;
    let mut best: Option<ProjectBoundary> = None;

    while let Some(dir) = current {
        if depth >= MAX_BOUNDARY_DEPTH {
            break;
        }

        let ignored = dir
            .file_name()
            .and_then(|name| name.to_str())
            .map(is_ignored_directory)
            .unwrap_or(false);

        if ignored {
            best = None;
        } else if let Some((marker, priority)) = PROJECT_MARKERS
            .iter()
            .find(|(marker, _)| dir.join(marker).exists())
        {
            let boundary = ProjectBoundary {
                path: dir.clone(),
                marker: *marker,
                priority: *priority,
            };
            if *priority == 1 {
                return Some(boundary);
            }
            // Nearer roots win ties.
            match &best {
                Some(existing) if existing.priority <= boundary.priority => {}
                _ => best = Some(boundary),
            }
        }

        if home_dir.as_deref() == Some(dir.as_path()) {
            break;
        }
        current = dir.parent().map(Path::to_path_buf);
        depth += 1;
    }

    best
}

/// Project name for `file_path`, if it sits under a recognizable root.
pub fn detect_project(file_path: &Path) -> Option<String> {
    find_project_boundary(file_path).and_then(|boundary| boundary.name())
}

#[must_use]
pub fn is_ignored_directory(name: &str) -> bool {
    IGNORED_DIRECTORIES.contains(&name)
}

fn read_project_file(path: &Path) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
