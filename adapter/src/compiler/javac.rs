//! javac. Fully relocatable in practice; only its output directories
//! need inferring.

/// The class and generated-source directories from `-d` and `-s`.
pub fn output_dirs(args: &[String]) -> Vec<String> {
    let mut dirs: Vec<String> = Vec::new();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "-d" || arg == "-s" {
            if let Some(value) = iter.next() {
                dirs.push(value.clone());
            }
        }
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::output_dirs;

    #[test]
    fn class_and_source_dirs() {
        let args: Vec<String> = ["javac", "-d", "classes", "-s", "gen", "A.java"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        assert_eq!(output_dirs(&args), vec!["classes", "gen"]);
    }

    #[test]
    fn none_without_flags() {
        let args: Vec<String> = ["javac", "A.java"].iter().map(|s| (*s).to_owned()).collect();
        assert!(output_dirs(&args).is_empty());
    }
}
