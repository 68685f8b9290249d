// Test modules for wgward
// Each module covers the corresponding source file; shared fakes live in support

mod support;

mod portforward_tests;
