//! Local, deterministic metadata extraction.

use analysis_coordination::{ExternalError, Extractor, FileMetadata, SourceFile};
use async_trait::async_trait;

/// Language guess from a file extension.
pub fn language_for(name: &str) -> Option<&'static str> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    let lang = match ext.as_str() {
        "java" => "java",
        "go" => "go",
        "py" => "python",
        "rs" => "rust",
        "c" | "h" => "c",
        "cpp" | "hpp" | "cc" => "cpp",
        "cs" => "csharp",
        "js" => "javascript",
        "ts" => "typescript",
        "rb" => "ruby",
        "php" => "php",
        "kt" => "kotlin",
        "scala" => "scala",
        "cbl" | "cob" => "cobol",
        "pl" => "perl",
        "sql" => "sql",
        "vb" => "vb",
        _ => return None,
    };
    Some(lang)
}

fn is_comment(line: &str, language: Option<&str>) -> bool {
    match language {
        Some("python" | "ruby" | "perl") => line.starts_with('#'),
        Some("sql") => line.starts_with("--"),
        Some("cobol") => line.starts_with('*'),
        Some("vb") => line.starts_with('\''),
        _ => line.starts_with("//") || line.starts_with("/*") || line.starts_with('*'),
    }
}

/// Counts lines, blank lines and comment lines, and tags the language.
///
/// A caller-supplied language hint wins over the extension guess.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsExtractor;

#[async_trait]
impl Extractor for FsExtractor {
    async fn extract(
        &self,
        file: &SourceFile,
        language_hint: Option<&str>,
    ) -> Result<FileMetadata, ExternalError> {
        if file.content.contains('\0') {
            return Err(ExternalError::InvalidResponse(format!(
                "{} looks like a binary file",
                file.name
            )));
        }

        let language = language_hint
            .map(str::to_ascii_lowercase)
            .or_else(|| language_for(&file.name).map(str::to_string));

        let mut total = 0u64;
        let mut blank = 0u64;
        let mut comments = 0u64;
        for line in file.content.lines() {
            total += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                blank += 1;
            } else if is_comment(trimmed, language.as_deref()) {
                comments += 1;
            }
        }

        Ok(FileMetadata::new(&file.name, language)
            .with_detail("lines", total)
            .with_detail("blank_lines", blank)
            .with_detail("comment_lines", comments)
            .with_detail("code_lines", total - blank - comments)
            .with_detail("bytes", file.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_counts_python() {
        let file = SourceFile::new(
            "report.py",
            Utc::now(),
            "# totals\nimport os\n\ndef run():\n    return os.getcwd()\n",
        );
        let meta = FsExtractor.extract(&file, None).await.unwrap();
        assert_eq!(meta.language.as_deref(), Some("python"));
        assert_eq!(meta.details["lines"], 5);
        assert_eq!(meta.details["blank_lines"], 1);
        assert_eq!(meta.details["comment_lines"], 1);
        assert_eq!(meta.details["code_lines"], 3);
    }

    #[tokio::test]
    async fn test_hint_overrides_extension() {
        let file = SourceFile::new("LEDGER.TXT", Utc::now(), "       IDENTIFICATION DIVISION.\n");
        let meta = FsExtractor.extract(&file, Some("COBOL")).await.unwrap();
        assert_eq!(meta.language.as_deref(), Some("cobol"));
    }

    #[tokio::test]
    async fn test_binary_rejected() {
        let file = SourceFile::new("blob.c", Utc::now(), "abc\0def");
        let err = FsExtractor.extract(&file, None).await.unwrap_err();
        assert!(matches!(err, ExternalError::InvalidResponse(_)));
    }

    #[test]
    fn test_language_for() {
        assert_eq!(language_for("Main.JAVA"), Some("java"));
        assert_eq!(language_for("ledger.go"), Some("go"));
        assert_eq!(language_for("Makefile"), None);
    }
}
