mod tests_version;
mod tests_versionset;
