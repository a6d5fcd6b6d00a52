// vim: tw=80
mod kcopyd;
mod mpath;
