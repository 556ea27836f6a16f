use std::path::PathBuf;

error_chain! {
    links {
        Tce(::tce::Error, ::tce::ErrorKind);
    }

    foreign_links {
        TomlDe(::toml::de::Error);
        Io(::std::io::Error);
        Json(::serde_json::Error);
        ParseInt(::std::num::ParseIntError);
    }

    errors {
        NoDescriptors {
            description("no listener descriptors, pass them on the command line or set `listen` in the config file")
        }

        BadConfig(path: PathBuf) {
            description("cannot read the configuration file")
            display("cannot read the configuration file {}", path.display())
        }

        NothingToMerge {
            description("at least one input file is required")
        }
    }
}
