//! Language labels for file heartbeats.

use std::collections::HashMap;
use std::path::Path;

/// Well-known file names that carry no useful extension.
const FILE_NAMES: &[(&str, &str)] = &[
    ("Dockerfile", "dockerfile"),
    ("Makefile", "makefile"),
    ("CMakeLists.txt", "cmake"),
    ("Cargo.lock", "toml"),
    ("Gemfile", "ruby"),
    ("Rakefile", "ruby"),
    ("Jenkinsfile", "groovy"),
    (".bashrc", "shellscript"),
    (".zshrc", "shellscript"),
];

/// Extension → label, using the editor's language identifiers.
const EXTENSIONS: &[(&str, &str)] = &[
    ("rs", "rust"),
    ("go", "go"),
    ("py", "python"),
    ("pyi", "python"),
    ("js", "javascript"),
    ("mjs", "javascript"),
    ("cjs", "javascript"),
    ("jsx", "javascriptreact"),
    ("ts", "typescript"),
    ("mts", "typescript"),
    ("tsx", "typescriptreact"),
    ("java", "java"),
    ("kt", "kotlin"),
    ("kts", "kotlin"),
    ("swift", "swift"),
    ("c", "c"),
    ("h", "c"),
    ("cc", "cpp"),
    ("cpp", "cpp"),
    ("cxx", "cpp"),
    ("hpp", "cpp"),
    ("cs", "csharp"),
    ("rb", "ruby"),
    ("php", "php"),
    ("dart", "dart"),
    ("scala", "scala"),
    ("ex", "elixir"),
    ("exs", "elixir"),
    ("hs", "haskell"),
    ("lua", "lua"),
    ("sh", "shellscript"),
    ("bash", "shellscript"),
    ("zsh", "shellscript"),
    ("sql", "sql"),
    ("html", "html"),
    ("htm", "html"),
    ("css", "css"),
    ("scss", "scss"),
    ("vue", "vue"),
    ("svelte", "svelte"),
    ("json", "json"),
    ("yaml", "yaml"),
    ("yml", "yaml"),
    ("toml", "toml"),
    ("xml", "xml"),
    ("md", "markdown"),
    ("markdown", "markdown"),
    ("proto", "proto3"),
];

/// Guesses a language label from a file path.
pub fn detect_language(path: &Path) -> Option<&'static str> {
    let file_name = path.file_name()?.to_str()?;
    if let Some((_, language)) = FILE_NAMES.iter().find(|(name, _)| *name == file_name) {
        return Some(*language);
    }

    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    EXTENSIONS
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, language)| *language)
}

/// Parses the `from:to,from:to` merge form; malformed pairs are skipped.
pub fn parse_alias_pairs(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (from, to) = pair.split_once(':')?;
            Some((from.to_string(), to.to_string()))
        })
        .collect()
}

/// Folds language labels into their configured canonical names.
#[derive(Debug, Clone, Default)]
pub struct LanguageAliases {
    aliases: HashMap<String, String>,
}

impl LanguageAliases {
    /// Keys are matched case-insensitively.
    pub fn new(aliases: &HashMap<String, String>) -> Self {
        Self {
            aliases: aliases
                .iter()
                .map(|(from, to)| (from.trim().to_ascii_lowercase(), to.trim().to_string()))
                .filter(|(from, to)| !from.is_empty() && !to.is_empty())
                .collect(),
        }
    }

    pub fn resolve(&self, language: &str) -> String {
        let trimmed = language.trim();
        self.aliases
            .get(&trimmed.to_ascii_lowercase())
            .cloned()
            .unwrap_or_else(|| trimmed.to_string())
    }
}
