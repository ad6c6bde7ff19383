mod tests_directory;
